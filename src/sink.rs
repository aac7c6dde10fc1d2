//! Stream sink: feeds raw panoramas to an external encoder process.
//!
//! The encoder (ffmpeg by default) reads raw interleaved frames on stdin and
//! publishes the encoded stream to the configured endpoint. The sink owns the
//! child for its whole life:
//! - a writer thread paces frames to the configured fps and writes them to stdin
//! - a drain thread forwards encoder stderr to `log::debug!`
//! - `stop()` (or `Drop`) closes stdin, waits a bounded time, then terminates
//!
//! `send` never blocks longer than `EncoderSettings::send_timeout`. Once the
//! encoder has exited or its pipe is broken, every `send` fails with
//! `PipelineError::StreamDisconnected`; restarting is the caller's decision.

use crossbeam_channel::{bounded, SendTimeoutError, Sender};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::frame::{PanoramaFrame, PixelFormat, Resolution};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const TERM_GRACE: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Where and how the panorama stream is published.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    pub url: String,
    pub resolution: Resolution,
    pub fps: u32,
    /// Encoder bitrate string, e.g. `4000k`.
    pub bitrate: String,
    pub format: PixelFormat,
}

/// Encoder process settings.
#[derive(Clone, Debug)]
pub struct EncoderSettings {
    pub program: String,
    /// Replaces the ffmpeg-style argument list when set.
    pub args: Option<Vec<String>>,
    pub send_timeout: Duration,
    pub stop_grace: Duration,
    /// Pace writes to the stream fps.
    pub pace: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            pace: true,
        }
    }
}

/// Outcome of a successful `send`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the writer thread.
    Queued,
    /// The encoder did not keep up within the send timeout; the frame was dropped.
    TimedOut,
}

/// ffmpeg invocation for raw frames on stdin, low-latency H.264 into FLV.
pub fn encoder_args(config: &StreamConfig) -> Vec<String> {
    let size = config.resolution.to_string();
    let fps = config.fps.to_string();
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-f",
        "rawvideo",
        "-pix_fmt",
        config.format.encoder_name(),
        "-s",
        &size,
        "-r",
        &fps,
        "-i",
        "-",
        "-c:v",
        "libx264",
        "-pix_fmt",
        "yuv420p",
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-g",
        &fps,
        "-bf",
        "0",
        "-b:v",
        &config.bitrate,
        "-maxrate",
        &config.bitrate,
        "-bufsize",
        &config.bitrate,
        "-flush_packets",
        "1",
        "-f",
        "flv",
        &config.url,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub struct StreamSink {
    config: StreamConfig,
    settings: EncoderSettings,
    child: Child,
    frames: Option<Sender<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
    write_error: Arc<Mutex<Option<String>>>,
    frames_written: Arc<AtomicU64>,
    exit_status: Option<ExitStatus>,
}

impl StreamSink {
    /// Launch the encoder and its helper threads.
    pub fn start(config: StreamConfig, settings: EncoderSettings) -> Result<Self, PipelineError> {
        let args = settings
            .args
            .clone()
            .unwrap_or_else(|| encoder_args(&config));
        log::debug!("StreamSink: {} {}", settings.program, args.join(" "));

        let mut child = Command::new(&settings.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                PipelineError::StreamDisconnected(format!(
                    "failed to start encoder {}: {}",
                    settings.program, err
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            PipelineError::StreamDisconnected("encoder stdin unavailable".to_string())
        })?;
        let stderr = child.stderr.take().map(|stderr| {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log::debug!("encoder: {}", line);
                }
            })
        });

        let (tx, rx) = bounded::<Vec<u8>>(1);
        let write_error = Arc::new(Mutex::new(None));
        let frames_written = Arc::new(AtomicU64::new(0));
        let interval = if settings.pace && config.fps > 0 {
            Some(Duration::from_secs_f64(1.0 / config.fps as f64))
        } else {
            None
        };
        let writer = {
            let write_error = Arc::clone(&write_error);
            let frames_written = Arc::clone(&frames_written);
            std::thread::spawn(move || {
                write_loop(stdin, rx, interval, &frames_written, &write_error)
            })
        };

        log::info!(
            "StreamSink: encoder {} started (pid {}) -> {} ({} @ {} fps, {})",
            settings.program,
            child.id(),
            config.url,
            config.resolution,
            config.fps,
            config.bitrate
        );

        Ok(Self {
            config,
            settings,
            child,
            frames: Some(tx),
            writer: Some(writer),
            stderr,
            write_error,
            frames_written,
            exit_status: None,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Frames fully written to the encoder pipe.
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Hand one panorama to the encoder.
    pub fn send(&mut self, frame: PanoramaFrame) -> Result<Delivery, PipelineError> {
        if frame.resolution() != self.config.resolution {
            return Err(PipelineError::ShapeMismatch {
                expected_width: self.config.resolution.width,
                expected_height: self.config.resolution.height,
                width: frame.width,
                height: frame.height,
            });
        }
        self.check_alive()?;

        let tx = self
            .frames
            .as_ref()
            .ok_or_else(|| PipelineError::StreamDisconnected("sink stopped".to_string()))?;
        match tx.send_timeout(frame.into_bytes(), self.settings.send_timeout) {
            Ok(()) => Ok(Delivery::Queued),
            Err(SendTimeoutError::Timeout(_)) => Ok(Delivery::TimedOut),
            Err(SendTimeoutError::Disconnected(_)) => Err(self.disconnected()),
        }
    }

    /// `Ok` while the encoder runs and its pipe accepts data.
    pub fn check_alive(&mut self) -> Result<(), PipelineError> {
        if self.exit_status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit_status = status,
                Err(err) => {
                    return Err(PipelineError::StreamDisconnected(format!(
                        "encoder status unavailable: {}",
                        err
                    )))
                }
            }
        }
        if self.exit_status.is_some() || self.frames.is_none() || self.write_failed() {
            return Err(self.disconnected());
        }
        Ok(())
    }

    fn write_failed(&self) -> bool {
        self.write_error
            .lock()
            .map(|e| e.is_some())
            .unwrap_or(true)
    }

    fn disconnected(&self) -> PipelineError {
        let reason = if let Some(status) = self.exit_status {
            format!("encoder exited with {}", status)
        } else if let Some(err) = self
            .write_error
            .lock()
            .ok()
            .and_then(|e| e.clone())
        {
            format!("encoder pipe failed: {}", err)
        } else {
            "sink stopped".to_string()
        };
        PipelineError::StreamDisconnected(reason)
    }

    /// Close the pipe and reap the encoder: graceful wait, then terminate, then kill.
    ///
    /// Idempotent; returns the encoder's exit status.
    pub fn stop(&mut self) -> Result<ExitStatus, PipelineError> {
        // Dropping the sender lets the writer drain and close stdin.
        self.frames = None;

        let status = match self.exit_status {
            Some(status) => status,
            None => self.reap()?,
        };
        self.exit_status = Some(status);

        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        if let Some(stderr) = self.stderr.take() {
            let _ = stderr.join();
        }
        log::info!(
            "StreamSink: encoder stopped ({}), {} frames written",
            status,
            self.frames_written()
        );
        Ok(status)
    }

    fn reap(&mut self) -> Result<ExitStatus, PipelineError> {
        if let Some(status) = self.wait_for(self.settings.stop_grace)? {
            return Ok(status);
        }
        log::warn!(
            "StreamSink: encoder did not exit within {:?}, terminating",
            self.settings.stop_grace
        );
        self.terminate();
        if let Some(status) = self.wait_for(TERM_GRACE)? {
            return Ok(status);
        }
        log::warn!("StreamSink: encoder ignored terminate, killing");
        let _ = self.child.kill();
        self.child.wait().map_err(|err| {
            PipelineError::StreamDisconnected(format!("failed to reap encoder: {}", err))
        })
    }

    fn wait_for(&mut self, limit: Duration) -> Result<Option<ExitStatus>, PipelineError> {
        let deadline = Instant::now() + limit;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) if Instant::now() >= deadline => return Ok(None),
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    return Err(PipelineError::StreamDisconnected(format!(
                        "failed to poll encoder: {}",
                        err
                    )))
                }
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        let Ok(pid) = libc::pid_t::try_from(self.child.id()) else {
            let _ = self.child.kill();
            return;
        };
        // SAFETY: pid belongs to our unreaped child, so it cannot have been recycled.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.kill();
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        if self.writer.is_some() || self.exit_status.is_none() {
            if let Err(err) = self.stop() {
                log::warn!("StreamSink: cleanup failed: {}", err);
            }
        }
    }
}

fn write_loop(
    mut stdin: ChildStdin,
    frames: crossbeam_channel::Receiver<Vec<u8>>,
    interval: Option<Duration>,
    frames_written: &AtomicU64,
    write_error: &Mutex<Option<String>>,
) {
    let mut next_due = Instant::now();
    for buf in frames.iter() {
        if let Some(interval) = interval {
            let now = Instant::now();
            if next_due > now {
                std::thread::sleep(next_due - now);
            }
            next_due = Instant::now().max(next_due + interval);
        }
        if let Err(err) = stdin.write_all(&buf).and_then(|_| stdin.flush()) {
            log::warn!("StreamSink: write to encoder failed: {}", err);
            if let Ok(mut slot) = write_error.lock() {
                *slot = Some(err.to_string());
            }
            return;
        }
        frames_written.fetch_add(1, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamConfig {
        StreamConfig {
            url: "rtmp://127.0.0.1:1935/live/test".to_string(),
            resolution: Resolution::new(3840, 1920),
            fps: 30,
            bitrate: "4000k".to_string(),
            format: PixelFormat::Bgr24,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn encoder_args_describe_raw_input_and_low_latency_output() {
        let args = encoder_args(&config());
        assert_eq!(value_after(&args, "-f"), Some("rawvideo"));
        assert_eq!(value_after(&args, "-pix_fmt"), Some("bgr24"));
        assert_eq!(value_after(&args, "-s"), Some("3840x1920"));
        assert_eq!(value_after(&args, "-r"), Some("30"));
        assert_eq!(value_after(&args, "-i"), Some("-"));
        assert_eq!(value_after(&args, "-tune"), Some("zerolatency"));
        assert_eq!(value_after(&args, "-b:v"), Some("4000k"));
        assert_eq!(args.last().map(String::as_str), Some("rtmp://127.0.0.1:1935/live/test"));
    }

    #[test]
    fn missing_encoder_program_fails_to_start() {
        let settings = EncoderSettings {
            program: "/nonexistent/panocast-encoder".to_string(),
            ..EncoderSettings::default()
        };
        match StreamSink::start(config(), settings) {
            Err(PipelineError::StreamDisconnected(reason)) => {
                assert!(reason.contains("failed to start"))
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[test]
    fn wrong_sized_frame_is_rejected() -> anyhow::Result<()> {
        let settings = EncoderSettings {
            program: "cat".to_string(),
            args: Some(Vec::new()),
            ..EncoderSettings::default()
        };
        let mut sink = StreamSink::start(config(), settings)?;
        let frame = PanoramaFrame::new(vec![0; 4 * 2 * 3], 4, 2, PixelFormat::Bgr24, 0)?;
        assert!(matches!(
            sink.send(frame),
            Err(PipelineError::ShapeMismatch { width: 4, height: 2, .. })
        ));
        sink.stop()?;
        Ok(())
    }
}
