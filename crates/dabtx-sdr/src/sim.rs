//! # Loopback Device
//!
//! An in-memory [`SdrDevice`] used by the test suite: it records every
//! TX burst with its metadata, serves scripted RX bursts, and lets the
//! test script device time, sensors and asynchronous events. No
//! hardware, no clocks of its own — time only moves when the test moves
//! it, which keeps the timestamp state machine deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use dabtx_core::types::Complexf;

use crate::device::{
    AsyncEvent, MessageHandler, RxBurstCommand, RxMetadata, SdrDevice, SdrError, SdrResult,
    SensorValue, TimeSpec, TxMetadata,
};

/// One recorded TX `send` call.
#[derive(Debug, Clone)]
pub struct TxBurst {
    pub samples: Vec<Complexf>,
    pub md: TxMetadata,
}

struct LoopbackState {
    clock_source: String,
    time_source: String,
    master_clock_rate: f64,
    /// Relative error applied to rate readbacks, for mismatch tests.
    rate_error_ppm: f64,
    tx_rate: f64,
    rx_rate: f64,
    tx_freq: f64,
    rx_freq: f64,
    tx_gain: f64,
    rx_gain: f64,
    rx_antenna: String,
    time: f64,
    max_tx_samples: usize,
    sent: Vec<TxBurst>,
    rx_bursts: VecDeque<(Vec<Complexf>, TimeSpec)>,
    rx_commands: Vec<RxBurstCommand>,
    async_events: VecDeque<AsyncEvent>,
    sensors: HashMap<String, SensorValue>,
    handler: Option<MessageHandler>,
}

pub struct LoopbackSdr {
    state: Mutex<LoopbackState>,
}

impl Default for LoopbackSdr {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSdr {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                clock_source: "internal".to_string(),
                time_source: "none".to_string(),
                master_clock_rate: 0.0,
                rate_error_ppm: 0.0,
                tx_rate: 0.0,
                rx_rate: 0.0,
                tx_freq: 0.0,
                rx_freq: 0.0,
                tx_gain: 0.0,
                rx_gain: 0.0,
                rx_antenna: String::new(),
                time: 0.0,
                max_tx_samples: 65536,
                sent: Vec::new(),
                rx_bursts: VecDeque::new(),
                rx_commands: Vec::new(),
                async_events: VecDeque::new(),
                sensors: HashMap::new(),
                handler: None,
            }),
        }
    }

    pub fn set_time(&self, seconds: f64) {
        self.state.lock().unwrap().time = seconds;
    }

    pub fn advance_time(&self, seconds: f64) {
        self.state.lock().unwrap().time += seconds;
    }

    pub fn set_master_clock_rate(&self, rate: f64) {
        self.state.lock().unwrap().master_clock_rate = rate;
    }

    pub fn set_rate_error_ppm(&self, ppm: f64) {
        self.state.lock().unwrap().rate_error_ppm = ppm;
    }

    pub fn set_max_tx_samples(&self, n: usize) {
        self.state.lock().unwrap().max_tx_samples = n;
    }

    pub fn set_sensor(&self, name: &str, value: SensorValue) {
        self.state
            .lock()
            .unwrap()
            .sensors
            .insert(name.to_string(), value);
    }

    pub fn clear_sensor(&self, name: &str) {
        self.state.lock().unwrap().sensors.remove(name);
    }

    pub fn push_async_event(&self, event: AsyncEvent) {
        self.state.lock().unwrap().async_events.push_back(event);
    }

    /// Queue one RX burst to be returned by the next `recv`.
    pub fn push_rx_burst(&self, samples: Vec<Complexf>, time: TimeSpec) {
        self.state.lock().unwrap().rx_bursts.push_back((samples, time));
    }

    /// Every TX burst recorded so far.
    pub fn sent_bursts(&self) -> Vec<TxBurst> {
        self.state.lock().unwrap().sent.clone()
    }

    /// All transmitted samples, concatenated in order.
    pub fn sent_samples(&self) -> Vec<Complexf> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .flat_map(|b| b.samples.iter().copied())
            .collect()
    }

    /// Every RX burst command issued so far.
    pub fn rx_commands(&self) -> Vec<RxBurstCommand> {
        self.state.lock().unwrap().rx_commands.clone()
    }

    pub fn clock_source(&self) -> String {
        self.state.lock().unwrap().clock_source.clone()
    }

    pub fn time_source(&self) -> String {
        self.state.lock().unwrap().time_source.clone()
    }

    pub fn rx_antenna(&self) -> String {
        self.state.lock().unwrap().rx_antenna.clone()
    }

    pub fn message_handler_installed(&self) -> bool {
        self.state.lock().unwrap().handler.is_some()
    }
}

impl SdrDevice for LoopbackSdr {
    fn device_name(&self) -> &str {
        "loopback"
    }

    fn set_clock_source(&self, source: &str) -> SdrResult<()> {
        self.state.lock().unwrap().clock_source = source.to_string();
        Ok(())
    }

    fn set_time_source(&self, source: &str) -> SdrResult<()> {
        self.state.lock().unwrap().time_source = source.to_string();
        Ok(())
    }

    fn master_clock_rate(&self) -> SdrResult<f64> {
        Ok(self.state.lock().unwrap().master_clock_rate)
    }

    fn set_tx_rate(&self, rate: f64) -> SdrResult<f64> {
        let mut state = self.state.lock().unwrap();
        state.tx_rate = rate;
        Ok(rate * (1.0 + state.rate_error_ppm * 1e-6))
    }

    fn set_rx_rate(&self, rate: f64) -> SdrResult<f64> {
        let mut state = self.state.lock().unwrap();
        state.rx_rate = rate;
        Ok(rate * (1.0 + state.rate_error_ppm * 1e-6))
    }

    fn set_tx_frequency(&self, frequency: f64, _lo_offset: f64) -> SdrResult<f64> {
        let mut state = self.state.lock().unwrap();
        state.tx_freq = frequency;
        Ok(frequency)
    }

    fn set_rx_frequency(&self, frequency: f64, _lo_offset: f64) -> SdrResult<f64> {
        let mut state = self.state.lock().unwrap();
        state.rx_freq = frequency;
        Ok(frequency)
    }

    fn set_tx_gain(&self, gain: f64) -> SdrResult<f64> {
        self.state.lock().unwrap().tx_gain = gain;
        Ok(gain)
    }

    fn set_rx_gain(&self, gain: f64) -> SdrResult<f64> {
        self.state.lock().unwrap().rx_gain = gain;
        Ok(gain)
    }

    fn set_rx_antenna(&self, antenna: &str) -> SdrResult<()> {
        self.state.lock().unwrap().rx_antenna = antenna.to_string();
        Ok(())
    }

    fn time_now(&self) -> f64 {
        self.state.lock().unwrap().time
    }

    fn set_time_now(&self, seconds: f64) -> SdrResult<()> {
        self.state.lock().unwrap().time = seconds;
        Ok(())
    }

    fn set_time_unknown_pps(&self, seconds: f64) -> SdrResult<()> {
        self.state.lock().unwrap().time = seconds;
        Ok(())
    }

    fn mboard_sensor(&self, name: &str) -> SdrResult<SensorValue> {
        self.state
            .lock()
            .unwrap()
            .sensors
            .get(name)
            .cloned()
            .ok_or_else(|| SdrError::SensorNotFound(name.to_string()))
    }

    fn max_tx_samples(&self) -> usize {
        self.state.lock().unwrap().max_tx_samples
    }

    fn send(&self, samples: &[Complexf], md: &TxMetadata, _timeout: Duration) -> SdrResult<usize> {
        let mut state = self.state.lock().unwrap();
        let n = samples.len().min(state.max_tx_samples);
        state.sent.push(TxBurst {
            samples: samples[..n].to_vec(),
            md: *md,
        });
        Ok(n)
    }

    fn issue_rx_burst(&self, cmd: RxBurstCommand) -> SdrResult<()> {
        self.state.lock().unwrap().rx_commands.push(cmd);
        Ok(())
    }

    fn recv(&self, buf: &mut [Complexf], _timeout: Duration) -> SdrResult<(usize, RxMetadata)> {
        let mut state = self.state.lock().unwrap();
        let (samples, time_spec) = state
            .rx_bursts
            .pop_front()
            .ok_or_else(|| SdrError::Timeout("rx samples".to_string()))?;
        let n = samples.len().min(buf.len());
        buf[..n].copy_from_slice(&samples[..n]);
        Ok((n, RxMetadata { time_spec }))
    }

    fn recv_async_event(&self, timeout: Duration) -> Option<AsyncEvent> {
        let event = self.state.lock().unwrap().async_events.pop_front();
        if event.is_none() {
            // Behave like a blocking driver poll without spinning.
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
        }
        event
    }

    fn register_message_handler(&self, handler: MessageHandler) {
        self.state.lock().unwrap().handler = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_records_bursts() {
        let dev = LoopbackSdr::new();
        let samples = vec![Complexf::new(1.0, 2.0); 10];
        let md = TxMetadata::default();
        assert_eq!(
            dev.send(&samples, &md, Duration::from_secs(1)).unwrap(),
            10
        );
        assert_eq!(dev.sent_bursts().len(), 1);
        assert_eq!(dev.sent_samples().len(), 10);
    }

    #[test]
    fn test_send_respects_max_tx_samples() {
        let dev = LoopbackSdr::new();
        dev.set_max_tx_samples(4);
        let samples = vec![Complexf::new(0.0, 0.0); 10];
        let n = dev
            .send(&samples, &TxMetadata::default(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn test_recv_serves_scripted_burst() {
        let dev = LoopbackSdr::new();
        dev.push_rx_burst(vec![Complexf::new(3.0, 4.0); 8], TimeSpec::new(5, 0.25));

        let mut buf = vec![Complexf::new(0.0, 0.0); 16];
        let (n, md) = dev.recv(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(n, 8);
        assert_eq!(md.time_spec.full_secs, 5);
        assert_eq!(buf[0], Complexf::new(3.0, 4.0));
    }

    #[test]
    fn test_recv_times_out_when_empty() {
        let dev = LoopbackSdr::new();
        let mut buf = vec![Complexf::new(0.0, 0.0); 4];
        assert!(matches!(
            dev.recv(&mut buf, Duration::from_millis(1)),
            Err(SdrError::Timeout(_))
        ));
    }

    #[test]
    fn test_missing_sensor() {
        let dev = LoopbackSdr::new();
        assert!(matches!(
            dev.mboard_sensor("ref_locked"),
            Err(SdrError::SensorNotFound(_))
        ));
        dev.set_sensor("ref_locked", SensorValue::Bool(true));
        assert!(dev.mboard_sensor("ref_locked").unwrap().to_bool());
    }
}
