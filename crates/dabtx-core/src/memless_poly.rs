//! # Memoryless Predistortion
//!
//! Applies an inverse nonlinearity sample-wise to compensate the power
//! amplifier downstream, in one of two forms selected by the loaded
//! coefficient set:
//!
//! - **Odd-order polynomial**: five AM/AM and five AM/PM coefficients
//!   evaluated on |x|², with the phase rotation synthesised from
//!   truncated Taylor series for cos and sin. The series constants are
//!   part of the output contract and are reproduced verbatim.
//! - **Lookup table**: the sample magnitude, scaled into the u32 range,
//!   indexes one of 32 complex correction factors by its high 5 bits.
//!
//! The multiply runs on a pool of long-lived worker threads one buffer
//! behind the pipeline, so `process` returns the output of the buffer
//! submitted two calls earlier.
//!
//! Coefficients load from a whitespace-separated ASCII file and can be
//! swapped atomically at runtime through the `coeffile` remote-control
//! parameter. A file with an unknown leading format tag disables the
//! stage (pass-through) without stopping the pipeline.

use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::pipeline::PipelinedStage;
use crate::rc::{RcError, RcResult, RemoteControllable};
use crate::types::{Complexf, Frame, ModError, ModResult};

/// Number of AM/AM coefficients, identical to the number of AM/PM coefficients.
pub const NUM_COEFS: usize = 5;

/// Number of lookup-table bins.
pub const LUT_ENTRIES: usize = 32;

const FILE_FORMAT_ODD_POLY: u32 = 1;
const FILE_FORMAT_LUT: u32 = 2;

/// One complete, validated predistortion model.
#[derive(Debug, Clone, PartialEq)]
pub enum CoefSet {
    OddPoly {
        am: [f32; NUM_COEFS],
        pm: [f32; NUM_COEFS],
    },
    Lut {
        scalefactor: f32,
        lut: [Complexf; LUT_ENTRIES],
    },
}

impl CoefSet {
    /// Parse a coefficient file's contents.
    ///
    /// Returns `Ok(None)` for an unknown format tag: the caller disables
    /// predistortion but keeps the pipeline running. All other malformed
    /// inputs are errors and leave any previously loaded set untouched.
    pub fn parse(text: &str) -> ModResult<Option<CoefSet>> {
        let mut tokens = text.split_whitespace();

        let tag = next_u32(&mut tokens, "format tag")?;
        match tag {
            FILE_FORMAT_ODD_POLY => {
                let n_coefs = next_u32(&mut tokens, "coefficient count")? as usize;
                if n_coefs == 0 {
                    return Err(ModError::CoefFile("invalid format".to_string()));
                }
                if n_coefs != NUM_COEFS {
                    return Err(ModError::CoefFile(format!(
                        "invalid number of coefficients: got {n_coefs}, expected {NUM_COEFS}"
                    )));
                }

                let mut am = [0.0f32; NUM_COEFS];
                let mut pm = [0.0f32; NUM_COEFS];
                for n in 0..2 * NUM_COEFS {
                    let value = next_f32(&mut tokens).ok_or_else(|| {
                        ModError::CoefFile(format!(
                            "expected {} coefficients, file ended after {n}",
                            2 * NUM_COEFS
                        ))
                    })?;
                    if n < NUM_COEFS {
                        am[n] = value;
                    } else {
                        pm[n - NUM_COEFS] = value;
                    }
                }
                Ok(Some(CoefSet::OddPoly { am, pm }))
            }
            FILE_FORMAT_LUT => {
                let scalefactor = next_f32(&mut tokens)
                    .ok_or_else(|| ModError::CoefFile("missing LUT scalefactor".to_string()))?;
                if !(scalefactor > 0.0) {
                    return Err(ModError::CoefFile(format!(
                        "LUT scalefactor must be positive, got {scalefactor}"
                    )));
                }

                // Entries are real on disk; the correction factors they
                // become are complex with zero imaginary part.
                let mut lut = [Complexf::new(0.0, 0.0); LUT_ENTRIES];
                for (n, entry) in lut.iter_mut().enumerate() {
                    let value = next_f32(&mut tokens).ok_or_else(|| {
                        ModError::CoefFile(format!(
                            "expected {LUT_ENTRIES} LUT entries, file ended after {n}"
                        ))
                    })?;
                    *entry = Complexf::new(value, 0.0);
                }
                Ok(Some(CoefSet::Lut { scalefactor, lut }))
            }
            other => {
                warn!("coefficient file has unknown format tag {other}, predistortion disabled");
                Ok(None)
            }
        }
    }

    /// Read and parse a coefficient file.
    pub fn from_file(path: &str) -> ModResult<Option<CoefSet>> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ModError::CoefFile(format!("could not open '{path}': {e}")))?;
        Self::parse(&text)
    }

    /// Apply the correction in place.
    pub fn apply(&self, samples: &mut [Complexf]) {
        match self {
            CoefSet::OddPoly { am, pm } => apply_odd_poly(am, pm, samples),
            CoefSet::Lut { scalefactor, lut } => apply_lut(lut, *scalefactor, samples),
        }
    }
}

fn next_u32<'a>(tokens: &mut impl Iterator<Item = &'a str>, what: &str) -> ModResult<u32> {
    tokens
        .next()
        .ok_or_else(|| ModError::CoefFile(format!("missing {what}")))?
        .parse()
        .map_err(|e| ModError::CoefFile(format!("bad {what}: {e}")))
}

fn next_f32<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<f32> {
    tokens.next().and_then(|t| t.parse().ok())
}

/// Polynomial branch. The Taylor constants define the output bit for bit.
fn apply_odd_poly(am: &[f32; NUM_COEFS], pm: &[f32; NUM_COEFS], samples: &mut [Complexf]) {
    for s in samples.iter_mut() {
        let in_mag_sq = s.re * s.re + s.im * s.im;

        let amplitude_correction = am[0]
            + in_mag_sq * (am[1] + in_mag_sq * (am[2] + in_mag_sq * (am[3] + in_mag_sq * am[4])));

        let phase_correction = -(pm[0]
            + in_mag_sq * (pm[1] + in_mag_sq * (pm[2] + in_mag_sq * (pm[3] + in_mag_sq * pm[4]))));

        let phase_sq = phase_correction * phase_correction;

        // cos x ~ 1 - 1/2 x^2 + 1/24 x^4 - 1/720 x^6
        let re = 1.0 - phase_sq * (-0.5 + phase_sq * (0.486666 + phase_sq * (-0.00138888)));

        // sin x ~ x + 1/6 x^3 + 1/120 x^5
        let im = phase_correction * (1.0 + phase_sq * (0.166666 + phase_sq * 0.00833333));

        *s = *s * amplitude_correction * Complexf::new(re, im);
    }
}

/// LUT branch. The scalefactor maps the expected magnitude range onto
/// u32, whose high 5 bits partition 0..=u32::MAX into 32 equal bins.
fn apply_lut(lut: &[Complexf; LUT_ENTRIES], scalefactor: f32, samples: &mut [Complexf]) {
    for s in samples.iter_mut() {
        let in_mag = s.norm();
        // The float-to-int cast saturates, covering magnitudes beyond
        // the range the scalefactor was chosen for.
        let scaled = (in_mag * scalefactor).round() as u32;
        let lut_ix = (scaled >> 27) as usize;
        *s = *s * lut[lut_ix];
    }
}

enum WorkerMsg {
    Job {
        samples: Vec<Complexf>,
        coefs: Arc<CoefSet>,
    },
    Terminate,
}

struct PoolWorker {
    job_tx: SyncSender<WorkerMsg>,
    done_rx: Receiver<Vec<Complexf>>,
    thread: Option<JoinHandle<()>>,
}

/// Long-lived worker pool for the sample-wise multiply. Lives on the
/// stage thread; torn down by a terminate message per worker.
struct WorkerPool {
    workers: Vec<PoolWorker>,
}

impl WorkerPool {
    fn new(num_workers: usize) -> ModResult<Self> {
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let (job_tx, job_rx) = std::sync::mpsc::sync_channel::<WorkerMsg>(1);
            let (done_tx, done_rx) = std::sync::mpsc::sync_channel::<Vec<Complexf>>(1);
            let thread = std::thread::Builder::new()
                .name(format!("dpd-worker-{i}"))
                .spawn(move || {
                    while let Ok(msg) = job_rx.recv() {
                        match msg {
                            WorkerMsg::Job { mut samples, coefs } => {
                                coefs.apply(&mut samples);
                                if done_tx.send(samples).is_err() {
                                    break;
                                }
                            }
                            WorkerMsg::Terminate => break,
                        }
                    }
                })
                .map_err(|e| ModError::Config(format!("failed to spawn DPD worker {i}: {e}")))?;
            workers.push(PoolWorker {
                job_tx,
                done_rx,
                thread: Some(thread),
            });
        }
        Ok(Self { workers })
    }

    /// Apply `coefs` across the buffer: the T workers each take one of
    /// the T leading slices of `len / (T + 1)` samples, the calling
    /// thread takes the tail, then awaits the workers in dispatch order.
    fn apply(&self, coefs: &Arc<CoefSet>, samples: &mut [Complexf]) -> ModResult<()> {
        let num_workers = self.workers.len();
        if num_workers == 0 {
            coefs.apply(samples);
            return Ok(());
        }

        let step = samples.len() / (num_workers + 1);
        for (i, worker) in self.workers.iter().enumerate() {
            let chunk = samples[i * step..(i + 1) * step].to_vec();
            worker
                .job_tx
                .send(WorkerMsg::Job {
                    samples: chunk,
                    coefs: Arc::clone(coefs),
                })
                .map_err(|_| ModError::StageStopped)?;
        }

        coefs.apply(&mut samples[num_workers * step..]);

        for (i, worker) in self.workers.iter().enumerate() {
            let done = worker.done_rx.recv().map_err(|_| ModError::StageStopped)?;
            samples[i * step..(i + 1) * step].copy_from_slice(&done);
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.job_tx.send(WorkerMsg::Terminate);
        }
        for worker in self.workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

/// Coefficient descriptor shared between the stage thread and the
/// remote-control surface. `None` means predistortion is disabled and
/// the stage passes samples through unchanged.
struct CoefStore {
    coefs: Mutex<Option<Arc<CoefSet>>>,
    file: Mutex<String>,
}

impl CoefStore {
    /// Load `path`, fully validate it, then swap the active set under
    /// the lock. Partial failures leave the previous set and path.
    fn reload(&self, path: &str) -> ModResult<()> {
        let parsed = CoefSet::from_file(path)?;
        match &parsed {
            Some(CoefSet::OddPoly { am, pm }) => {
                info!("loaded {} polynomial coefficients", am.len() + pm.len())
            }
            Some(CoefSet::Lut { lut, .. }) => info!("loaded {} LUT entries", lut.len()),
            None => {}
        }
        *self.coefs.lock().unwrap() = parsed.map(Arc::new);
        *self.file.lock().unwrap() = path.to_string();
        Ok(())
    }

    fn ncoefs(&self) -> usize {
        match self.coefs.lock().unwrap().as_deref() {
            Some(CoefSet::OddPoly { am, .. }) => am.len(),
            _ => 0,
        }
    }
}

/// The predistortion stage: a pipelined executor whose thread owns the
/// worker pool, plus the shared coefficient store.
pub struct MemlessPoly {
    stage: PipelinedStage,
    store: Arc<CoefStore>,
}

impl MemlessPoly {
    /// Load the initial coefficient file and start the stage thread and
    /// its `num_workers` pool threads. `num_workers == 0` runs the
    /// multiply entirely on the stage thread.
    pub fn new(coefs_file: &str, num_workers: usize) -> ModResult<Self> {
        let store = Arc::new(CoefStore {
            coefs: Mutex::new(None),
            file: Mutex::new(String::new()),
        });
        store.reload(coefs_file)?;

        info!("digital predistorter will use {num_workers} worker threads");

        let pool = WorkerPool::new(num_workers)?;
        let stage_store = Arc::clone(&store);
        let stage = PipelinedStage::spawn("memless-poly", move |mut frame: Frame| {
            let coefs = stage_store.coefs.lock().unwrap().clone();
            if let Some(coefs) = coefs {
                if let Err(e) = pool.apply(&coefs, &mut frame.samples) {
                    error!("predistortion worker pool failed: {e}");
                }
            }
            frame
        })?;

        Ok(Self { stage, store })
    }

    /// Submit one buffer; returns the output of the buffer submitted two
    /// calls earlier (zero filler for the first two calls).
    pub fn process(&mut self, frame: Frame) -> ModResult<Frame> {
        self.stage.process(frame)
    }

    /// Atomically swap in a new coefficient file.
    pub fn reload(&self, path: &str) -> ModResult<()> {
        self.store.reload(path)
    }

    /// Number of AM coefficients of the active set (0 when disabled or
    /// when a LUT is loaded).
    pub fn ncoefs(&self) -> usize {
        self.store.ncoefs()
    }

    /// Handle for the remote-control registry.
    pub fn rc_handle(&self) -> Arc<dyn RemoteControllable> {
        Arc::new(PolyRc {
            store: Arc::clone(&self.store),
        })
    }
}

struct PolyRc {
    store: Arc<CoefStore>,
}

impl RemoteControllable for PolyRc {
    fn rc_name(&self) -> &str {
        "memlesspoly"
    }

    fn parameters(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("ncoefs", "(Read-only) number of coefficients"),
            (
                "coeffile",
                "Filename containing coefficients. When set, the file gets loaded",
            ),
        ]
    }

    fn set_parameter(&self, parameter: &str, value: &str) -> RcResult<()> {
        match parameter {
            "ncoefs" => Err(RcError::ReadOnly(parameter.to_string())),
            "coeffile" => self.store.reload(value).map_err(|e| RcError::InvalidValue {
                parameter: parameter.to_string(),
                message: e.to_string(),
            }),
            _ => Err(RcError::UnknownParameter {
                component: self.rc_name().to_string(),
                parameter: parameter.to_string(),
            }),
        }
    }

    fn get_parameter(&self, parameter: &str) -> RcResult<String> {
        match parameter {
            "ncoefs" => Ok(self.store.ncoefs().to_string()),
            "coeffile" => Ok(self.store.file.lock().unwrap().clone()),
            _ => Err(RcError::UnknownParameter {
                component: self.rc_name().to_string(),
                parameter: parameter.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    const POLY_IDENTITY: &str = "1 5  1 0 0 0 0  0 0 0 0 0";

    fn lut_passthrough() -> String {
        let mut text = String::from("2 1.0\n");
        for _ in 0..LUT_ENTRIES {
            text.push_str("1.0 ");
        }
        text
    }

    fn random_samples(n: usize) -> Vec<Complexf> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| Complexf::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect()
    }

    fn write_temp(name: &str, contents: &str) -> String {
        let path = std::env::temp_dir().join(format!("dabtx-coef-{name}-{}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_parse_odd_poly() {
        let set = CoefSet::parse("1 5  0.9 0.1 0 0 0  0.01 0 0 0 0")
            .unwrap()
            .unwrap();
        match set {
            CoefSet::OddPoly { am, pm } => {
                assert_relative_eq!(am[0], 0.9);
                assert_relative_eq!(am[1], 0.1);
                assert_relative_eq!(pm[0], 0.01);
            }
            _ => panic!("expected polynomial set"),
        }
    }

    #[test]
    fn test_parse_rejects_wrong_count() {
        let err = CoefSet::parse("1 4  1 0 0 0  0 0 0 0").unwrap_err();
        assert!(err.to_string().contains("got 4"));
    }

    #[test]
    fn test_parse_rejects_truncated_file() {
        let err = CoefSet::parse("1 5  1 0 0").unwrap_err();
        assert!(err.to_string().contains("ended after 3"));
    }

    #[test]
    fn test_parse_lut() {
        let set = CoefSet::parse(&lut_passthrough()).unwrap().unwrap();
        match set {
            CoefSet::Lut { scalefactor, lut } => {
                assert_relative_eq!(scalefactor, 1.0);
                assert!(lut.iter().all(|c| *c == Complexf::new(1.0, 0.0)));
            }
            _ => panic!("expected LUT set"),
        }
    }

    #[test]
    fn test_parse_unknown_tag_disables() {
        assert_eq!(CoefSet::parse("9 1 2 3").unwrap(), None);
    }

    #[test]
    fn test_poly_identity_is_bit_exact() {
        let set = CoefSet::parse(POLY_IDENTITY).unwrap().unwrap();
        let input = random_samples(512);
        let mut out = input.clone();
        set.apply(&mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn test_poly_pure_gain() {
        let set = CoefSet::parse("1 5  2 0 0 0 0  0 0 0 0 0").unwrap().unwrap();
        let mut out = vec![Complexf::new(0.5, -0.25)];
        set.apply(&mut out);
        assert_eq!(out[0], Complexf::new(1.0, -0.5));
    }

    #[test]
    fn test_lut_passthrough_is_bit_exact() {
        let set = CoefSet::parse(&lut_passthrough()).unwrap().unwrap();
        let input = random_samples(4096);
        let mut out = input.clone();
        set.apply(&mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn test_lut_binning_uses_high_bits() {
        // Scalefactor maps magnitude 1.0 to u32::MAX, so magnitude 1.0
        // lands in the last bin and tiny magnitudes in bin 0.
        let mut lut = [Complexf::new(1.0, 0.0); LUT_ENTRIES];
        lut[0] = Complexf::new(2.0, 0.0);
        lut[31] = Complexf::new(3.0, 0.0);
        let set = CoefSet::Lut {
            scalefactor: u32::MAX as f32,
            lut,
        };

        let mut out = vec![Complexf::new(1e-6, 0.0), Complexf::new(1.0, 0.0)];
        set.apply(&mut out);
        assert_relative_eq!(out[0].re, 2e-6, epsilon = 1e-12);
        assert_relative_eq!(out[1].re, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pool_matches_single_threaded() {
        let set = Arc::new(
            CoefSet::parse("1 5  1.1 -0.2 0.05 0 0  0.02 -0.01 0 0 0")
                .unwrap()
                .unwrap(),
        );
        let input = random_samples(1003); // deliberately not divisible

        let mut reference = input.clone();
        set.apply(&mut reference);

        for workers in [1, 2, 3, 7] {
            let pool = WorkerPool::new(workers).unwrap();
            let mut out = input.clone();
            pool.apply(&set, &mut out).unwrap();
            assert_eq!(out, reference, "mismatch with {workers} workers");
        }
    }

    #[test]
    fn test_stage_delay_and_passthrough_when_disabled() {
        let path = write_temp("unknown-tag", "7 0 0");
        let mut poly = MemlessPoly::new(&path, 0).unwrap();
        assert_eq!(poly.ncoefs(), 0);

        let input = Frame::from_samples(random_samples(64));
        let out1 = poly.process(input.clone()).unwrap();
        let out2 = poly.process(input.clone()).unwrap();
        assert_eq!(out1, Frame::silence(64));
        assert_eq!(out2, Frame::silence(64));

        // Third call yields the first input, untouched (pass-through).
        let out3 = poly.process(input.clone()).unwrap();
        assert_eq!(out3.samples, input.samples);
    }

    #[test]
    fn test_reload_keeps_previous_set_on_error() {
        let path = write_temp("identity", POLY_IDENTITY);
        let poly = MemlessPoly::new(&path, 0).unwrap();
        assert_eq!(poly.ncoefs(), 5);

        assert!(poly.reload("/nonexistent/coefs.txt").is_err());
        assert_eq!(poly.ncoefs(), 5);

        let rc = poly.rc_handle();
        assert_eq!(rc.get_parameter("coeffile").unwrap(), path);
    }

    #[test]
    fn test_rc_coeffile_reload() {
        let poly_path = write_temp("rc-poly", POLY_IDENTITY);
        let lut_path = write_temp("rc-lut", &lut_passthrough());

        let poly = MemlessPoly::new(&poly_path, 0).unwrap();
        let rc = poly.rc_handle();
        assert_eq!(rc.get_parameter("ncoefs").unwrap(), "5");

        rc.set_parameter("coeffile", &lut_path).unwrap();
        assert_eq!(rc.get_parameter("ncoefs").unwrap(), "0");
        assert_eq!(rc.get_parameter("coeffile").unwrap(), lut_path);

        assert!(rc.set_parameter("ncoefs", "3").is_err());
    }

    #[test]
    fn test_missing_initial_file_is_an_error() {
        assert!(MemlessPoly::new("/nonexistent/coefs.txt", 0).is_err());
    }
}
