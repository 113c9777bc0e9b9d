//! Infrared emission on a dedicated thread
//!
//! The worker thread owns the transmitter. Bursts are queued to it over a
//! channel and answered with a oneshot, so the async runtime never blocks and
//! no blocking-pool queue sits between the tool call and the GPIO line.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::oneshot;

use crate::{Error, Result};

/// Carrier modulation for marks
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Carrier {
    pub frequency_hz: u32,
    /// Fraction of each period the LED is on
    pub duty_cycle: f64,
}

impl Default for Carrier {
    fn default() -> Self {
        Self {
            frequency_hz: 38_000,
            duty_cycle: 0.33,
        }
    }
}

impl Carrier {
    /// Carrier period and on-time
    #[must_use]
    pub fn timing(&self) -> (Duration, Duration) {
        let period_ns = 1_000_000_000_u64 / u64::from(self.frequency_hz.max(1));
        let period = Duration::from_nanos(period_ns);
        (period, period.mul_f64(self.duty_cycle.clamp(0.0, 1.0)))
    }
}

/// Something that can emit a pulse train
///
/// `pulses` alternate mark/space in µs, starting with a mark.
pub trait IrTransmitter: Send + 'static {
    /// Emit one frame
    ///
    /// # Errors
    ///
    /// Returns `ToolExecution` if the hardware rejects the write
    fn transmit(&mut self, pulses: &[u32]) -> Result<()>;
}

/// One frame sent `count` times with `gap` between sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Burst {
    pub frame: Vec<u32>,
    pub count: u32,
    pub gap: Duration,
}

struct Job {
    burst: Burst,
    reply: oneshot::Sender<Result<()>>,
}

/// Handle to the emission thread
pub struct IrWorker {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for IrWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrWorker").finish_non_exhaustive()
    }
}

impl IrWorker {
    /// Start the emission thread
    ///
    /// # Errors
    ///
    /// Returns `Io` if the thread cannot be spawned
    pub fn spawn(name: &str, mut transmitter: Box<dyn IrTransmitter>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name(format!("ir-{name}"))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    let result = run_burst(transmitter.as_mut(), &job.burst);
                    // Caller may have timed out and gone away
                    let _ = job.reply.send(result);
                }
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a burst and wait for it to finish
    ///
    /// # Errors
    ///
    /// Returns `ToolExecution` if the thread is gone or transmission failed
    pub async fn send(&self, burst: Burst) -> Result<()> {
        let (reply, done) = oneshot::channel();
        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = sender
                .as_ref()
                .ok_or_else(|| Error::ToolExecution("transmitter is shut down".to_string()))?;
            sender
                .send(Job { burst, reply })
                .map_err(|_| Error::ToolExecution("transmitter thread stopped".to_string()))?;
        }

        done.await
            .map_err(|_| Error::ToolExecution("transmitter thread dropped the request".to_string()))?
    }

    /// Stop accepting bursts and wait for the thread to finish the current one
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::warn!("infrared transmitter thread ended abnormally");
            }
        }
    }
}

fn run_burst(transmitter: &mut dyn IrTransmitter, burst: &Burst) -> Result<()> {
    for i in 0..burst.count {
        if i > 0 {
            std::thread::sleep(burst.gap);
        }
        transmitter.transmit(&burst.frame)?;
    }
    Ok(())
}

/// Sent frames recorded by [`DryRunTransmitter`]
pub type FrameLog = Arc<Mutex<Vec<Vec<u32>>>>;

/// Transmitter that records frames instead of driving hardware
#[derive(Debug, Clone, Default)]
pub struct DryRunTransmitter {
    log: FrameLog,
}

impl DryRunTransmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the recorded frames
    #[must_use]
    pub fn log(&self) -> FrameLog {
        Arc::clone(&self.log)
    }
}

impl IrTransmitter for DryRunTransmitter {
    fn transmit(&mut self, pulses: &[u32]) -> Result<()> {
        tracing::debug!(pulses = pulses.len(), "dry-run infrared frame");
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pulses.to_vec());
        Ok(())
    }
}

#[cfg(all(feature = "gpio", target_os = "linux"))]
mod gpio {
    use std::time::{Duration, Instant};

    use rppal::gpio::{Gpio, OutputPin};

    use super::{Carrier, IrTransmitter};
    use crate::{Error, Result};

    /// Bit-banged transmitter on a Raspberry Pi GPIO line
    pub struct GpioTransmitter {
        pin: OutputPin,
        period: Duration,
        on_time: Duration,
    }

    impl GpioTransmitter {
        pub fn open(pin: u8, carrier: Carrier) -> Result<Self> {
            let pin = Gpio::new()
                .and_then(|gpio| gpio.get(pin))
                .map_err(|e| Error::construction(format!("gpio:{pin}"), e))?
                .into_output_low();
            let (period, on_time) = carrier.timing();
            Ok(Self {
                pin,
                period,
                on_time,
            })
        }

        fn mark(&mut self, duration: Duration) {
            let end = Instant::now() + duration;
            while Instant::now() < end {
                let cycle = Instant::now();
                self.pin.set_high();
                spin_until(cycle + self.on_time);
                self.pin.set_low();
                spin_until(cycle + self.period);
            }
        }

        fn space(&mut self, duration: Duration) {
            self.pin.set_low();
            spin_until(Instant::now() + duration);
        }
    }

    fn spin_until(deadline: Instant) {
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }

    impl IrTransmitter for GpioTransmitter {
        fn transmit(&mut self, pulses: &[u32]) -> Result<()> {
            for (i, &us) in pulses.iter().enumerate() {
                let duration = Duration::from_micros(u64::from(us));
                if i % 2 == 0 {
                    self.mark(duration);
                } else {
                    self.space(duration);
                }
            }
            self.pin.set_low();
            Ok(())
        }
    }
}

/// Open the hardware transmitter for `pin`
///
/// # Errors
///
/// Returns `Construction` if GPIO is unavailable on this build or host
#[cfg(all(feature = "gpio", target_os = "linux"))]
pub fn open_gpio(pin: u8, carrier: Carrier) -> Result<Box<dyn IrTransmitter>> {
    Ok(Box::new(gpio::GpioTransmitter::open(pin, carrier)?))
}

/// Open the hardware transmitter for `pin`
///
/// # Errors
///
/// Always returns `Construction`: this build has no GPIO driver
#[cfg(not(all(feature = "gpio", target_os = "linux")))]
pub fn open_gpio(pin: u8, _carrier: Carrier) -> Result<Box<dyn IrTransmitter>> {
    Err(Error::construction(
        format!("gpio:{pin}"),
        "GPIO support not built (enable the `gpio` feature on Linux, or set driver: dry_run)",
    ))
}
