//! # DPD Feedback Server
//!
//! Presents a TCP socket to an external tool that estimates a new
//! predistortion model from a short sequence of transmit samples and
//! the corresponding receive samples.
//!
//! ## Capture interlock
//!
//! A request walks a four-state machine shared by three threads:
//!
//! - `Idle`: no client request outstanding; TX offers are ignored.
//! - `SaveTx`: the TCP handler has parked a request. The next TX offer
//!   captures the final N samples of the frame (a transmission frame
//!   begins with the null symbol, which carries no power; taking the
//!   tail avoids it) and advances the stored timestamp accordingly.
//! - `SaveRx`: the capture thread issues a timed finite receive at the
//!   captured TX time and reads back up to N samples.
//! - `Acquired`: the TCP handler serialises the response and returns
//!   the machine to `Idle`.
//!
//! ## Wire protocol (all integers little-endian)
//!
//! Client: `u8` version (must be 1), `u32` sample count. Server: `u32`
//! effective count, `u32` TX sec, `u32` TX pps, TX I/Q as f32 pairs,
//! `u32` RX sec, `u32` RX pps, RX I/Q as f32 pairs. Any protocol
//! violation closes the connection. One client at a time.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use dabtx_core::timestamp::{FrameTimestamp, PPS_TICKS_PER_SECOND};
use dabtx_core::types::Complexf;

use crate::device::{RxBurstCommand, SdrDevice, SdrError, SdrResult, TimeSpec};

pub const PROTOCOL_VERSION: u8 = 1;

/// Timeout for the timed receive of the feedback burst.
const RX_TIMEOUT: Duration = Duration::from_secs(60);

/// Accept poll granularity, so shutdown is bounded.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BurstState {
    Idle,
    SaveTx,
    SaveRx,
    Acquired,
}

struct BurstRequest {
    state: BurstState,
    num_samples: usize,
    tx_sec: u32,
    tx_pps: u32,
    tx_samples: Vec<Complexf>,
    rx_sec: u32,
    rx_pps: u32,
    rx_samples: Vec<Complexf>,
}

struct FeedbackShared {
    request: Mutex<BurstRequest>,
    notify: Condvar,
    running: AtomicBool,
    device: Arc<dyn SdrDevice>,
    sample_rate: u32,
}

/// Serves paired TX/RX sample bursts on a TCP port. Faults are
/// isolated: a dead server is rebuilt by the sink without touching the
/// TX path.
pub struct FeedbackServer {
    shared: Arc<FeedbackShared>,
    port: u16,
    rx_thread: Option<JoinHandle<()>>,
    tcp_thread: Option<JoinHandle<()>>,
}

impl FeedbackServer {
    /// Bind the port and start the capture and server threads. Port 0
    /// binds an ephemeral port (see [`FeedbackServer::port`]).
    pub fn start(device: Arc<dyn SdrDevice>, port: u16, sample_rate: u32) -> SdrResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| SdrError::Hardware(format!("feedback server bind port {port}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| SdrError::Hardware(format!("feedback server socket: {e}")))?;
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let shared = Arc::new(FeedbackShared {
            request: Mutex::new(BurstRequest {
                state: BurstState::Idle,
                num_samples: 0,
                tx_sec: 0,
                tx_pps: 0,
                tx_samples: Vec::new(),
                rx_sec: 0,
                rx_pps: 0,
                rx_samples: Vec::new(),
            }),
            notify: Condvar::new(),
            running: AtomicBool::new(true),
            device,
            sample_rate,
        });

        let rx_shared = Arc::clone(&shared);
        let rx_thread = std::thread::Builder::new()
            .name("dpd-receive-burst".to_string())
            .spawn(move || receive_burst_loop(rx_shared))
            .map_err(|e| SdrError::Hardware(format!("failed to spawn capture thread: {e}")))?;

        let tcp_shared = Arc::clone(&shared);
        let tcp_thread = std::thread::Builder::new()
            .name("dpd-feedback-server".to_string())
            .spawn(move || serve_loop(tcp_shared, listener))
            .map_err(|e| SdrError::Hardware(format!("failed to spawn server thread: {e}")))?;

        info!("DPD feedback server listening on port {port}");

        Ok(Self {
            shared,
            port,
            rx_thread: Some(rx_thread),
            tcp_thread: Some(tcp_thread),
        })
    }

    /// The bound TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Offer one outgoing frame to a pending capture. Called by the
    /// sink for every frame it queues; a no-op unless a client request
    /// is waiting in `SaveTx`.
    pub fn set_tx_frame(&self, samples: &[Complexf], ts: &FrameTimestamp) -> SdrResult<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(SdrError::Hardware("feedback server not running".to_string()));
        }

        let mut req = self.shared.request.lock().unwrap();
        if req.state != BurstState::SaveTx {
            return Ok(());
        }

        let n = req.num_samples.min(samples.len());
        req.num_samples = n;
        let start_ix = samples.len() - n;
        req.tx_samples = samples[start_ix..].to_vec();

        let adjusted = ts.offset_by(start_ix as f64 / self.shared.sample_rate as f64);
        req.tx_sec = adjusted.sec;
        req.tx_pps = adjusted.pps;

        // The receive is commanded at the same time the captured TX
        // samples go on air.
        req.rx_sec = adjusted.sec;
        req.rx_pps = adjusted.pps;
        req.state = BurstState::SaveRx;

        drop(req);
        self.shared.notify.notify_all();
        Ok(())
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.notify.notify_all();
        if let Some(thread) = self.rx_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.tcp_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FeedbackServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_burst_loop(shared: Arc<FeedbackShared>) {
    while shared.running.load(Ordering::SeqCst) {
        let (num_samples, rx_sec, rx_pps, tx_sec, tx_pps) = {
            let mut req = shared.request.lock().unwrap();
            while req.state != BurstState::SaveRx {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                req = shared.notify.wait(req).unwrap();
            }
            (req.num_samples, req.rx_sec, req.rx_pps, req.tx_sec, req.tx_pps)
        };

        // The mutex stays free during the receive so the TX offers are
        // never blocked behind it.
        let command_time = TimeSpec::new(
            rx_sec as i64,
            rx_pps as f64 / PPS_TICKS_PER_SECOND as f64,
        );
        let device_time = shared.device.time_now();
        let mut buf = vec![Complexf::new(0.0, 0.0); num_samples];

        let result = shared
            .device
            .issue_rx_burst(RxBurstCommand {
                num_samples,
                stream_now: false,
                time_spec: command_time,
            })
            .and_then(|_| shared.device.recv(&mut buf, RX_TIMEOUT));

        match result {
            Ok((samples_read, md)) => {
                let mut req = shared.request.lock().unwrap();
                buf.truncate(samples_read);
                req.rx_samples = buf;
                // The receive may have happened at another time than
                // requested.
                req.rx_sec = md.time_spec.full_secs as u32;
                req.rx_pps =
                    (md.time_spec.frac_secs * PPS_TICKS_PER_SECOND as f64).round() as u32;
                req.state = BurstState::Acquired;
                debug!(
                    "acquired {samples_read} RX feedback samples at time {}+{:.6}, delta {:.6}",
                    tx_sec,
                    tx_pps as f64 / PPS_TICKS_PER_SECOND as f64,
                    command_time.real_secs() - device_time
                );
                drop(req);
                shared.notify.notify_all();
            }
            Err(e) => {
                error!("feedback RX capture failed: {e}");
                shared.running.store(false, Ordering::SeqCst);
                shared.notify.notify_all();
                return;
            }
        }
    }
}

fn serve_loop(shared: Arc<FeedbackShared>, listener: TcpListener) {
    while shared.running.load(Ordering::SeqCst) {
        match accept_with_timeout(&listener, ACCEPT_TIMEOUT) {
            Ok(Some(stream)) => {
                if let Err(e) = handle_client(&shared, stream) {
                    info!("feedback client failed: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("feedback server accept failed: {e}");
                std::thread::sleep(Duration::from_secs(5));
            }
        }
    }
}

fn accept_with_timeout(
    listener: &TcpListener,
    timeout: Duration,
) -> std::io::Result<Option<TcpStream>> {
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => return Ok(Some(stream)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e),
        }
    }
}

fn handle_client(shared: &FeedbackShared, mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    let mut version = [0u8; 1];
    stream.read_exact(&mut version)?;
    if version[0] != PROTOCOL_VERSION {
        info!("feedback client sent wrong request version {}", version[0]);
        return Ok(());
    }

    let mut count = [0u8; 4];
    stream.read_exact(&mut count)?;
    let requested = u32::from_le_bytes(count) as usize;
    debug!("feedback client requests {requested} samples");

    {
        let mut req = shared.request.lock().unwrap();
        req.num_samples = requested;
        req.state = BurstState::SaveTx;
    }

    // Wait for the TX offer and the RX capture to run their course.
    let (num_samples, tx_sec, tx_pps, tx_samples, rx_sec, rx_pps, rx_samples) = {
        let mut req = shared.request.lock().unwrap();
        while req.state != BurstState::Acquired {
            if !shared.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            req = shared.notify.wait(req).unwrap();
        }
        req.state = BurstState::Idle;

        let n = req
            .num_samples
            .min(req.tx_samples.len())
            .min(req.rx_samples.len());
        (
            n,
            req.tx_sec,
            req.tx_pps,
            req.tx_samples[..n].to_vec(),
            req.rx_sec,
            req.rx_pps,
            req.rx_samples[..n].to_vec(),
        )
    };

    stream.write_all(&(num_samples as u32).to_le_bytes())?;
    stream.write_all(&tx_sec.to_le_bytes())?;
    stream.write_all(&tx_pps.to_le_bytes())?;
    write_samples(&mut stream, &tx_samples)?;
    stream.write_all(&rx_sec.to_le_bytes())?;
    stream.write_all(&rx_pps.to_le_bytes())?;
    write_samples(&mut stream, &rx_samples)?;
    Ok(())
}

fn write_samples(stream: &mut TcpStream, samples: &[Complexf]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(samples.len() * 8);
    for s in samples {
        buf.extend_from_slice(&s.re.to_le_bytes());
        buf.extend_from_slice(&s.im.to_le_bytes());
    }
    stream.write_all(&buf)
}
