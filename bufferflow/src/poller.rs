//! Worker status protocol client.
//!
//! A worker listens on `127.0.0.1:{port}`. The client sends the ASCII text
//! `status` and the worker answers with one line:
//!
//! | Reply                                  | Next poll after |
//! |----------------------------------------|-----------------|
//! | `Step 1 in process.` .. `Step 3 ...`   | 15 s            |
//! | `Step 4 in process.`                   | 10 s            |
//! | `Step 5 in process.`                   | 5 s             |
//! | `Step 6 in process.`                   | 1 s             |
//! | anything else                          | 5 s             |
//!
//! A reply containing `Whole process done, socket closed.` ends the session.
//! Connection refusals are expected while the worker starts up and are
//! retried; the job-level wall-clock timer bounds the whole session.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::control::{EngineControl, Shutdown};

/// Status request sent to the worker.
pub const STATUS_REQUEST: &[u8] = b"status";

/// Completion literal. Matched as a substring.
pub const DONE_REPLY: &str = "Whole process done, socket closed.";

/// Consecutive failed exchanges after which the session gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default wait after a failed connect or exchange.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(1);

/// Default bound on a single connect or reply read.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_STEP: u8 = 6;
const REPLY_BUFFER_SIZE: usize = 1024;

/// Status session errors.
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("Worker on port {port} failed {attempts} consecutive status requests: {source}")]
    ReadFailures {
        port: u16,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Interrupted by shutdown")]
    Shutdown(#[from] Shutdown),
}

/// A parsed worker reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    /// `Step N in process.` with N in 1..=6
    Step(u8),
    Done,
    Unrecognized(String),
}

impl WorkerReply {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.contains(DONE_REPLY) {
            return WorkerReply::Done;
        }
        text.strip_prefix("Step ")
            .and_then(|rest| rest.strip_suffix(" in process."))
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|n| (1..=MAX_STEP).contains(n))
            .map(WorkerReply::Step)
            .unwrap_or_else(|| WorkerReply::Unrecognized(text.to_string()))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, WorkerReply::Done)
    }
}

/// Step-dependent wait between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCadence {
    pub steps_1_to_3: Duration,
    pub step_4: Duration,
    pub step_5: Duration,
    pub step_6: Duration,
    pub default: Duration,
}

impl PollCadence {
    pub const STANDARD: PollCadence = PollCadence {
        steps_1_to_3: Duration::from_secs(15),
        step_4: Duration::from_secs(10),
        step_5: Duration::from_secs(5),
        step_6: Duration::from_secs(1),
        default: Duration::from_secs(5),
    };

    /// The same wait after every reply.
    pub const fn uniform(wait: Duration) -> Self {
        Self {
            steps_1_to_3: wait,
            step_4: wait,
            step_5: wait,
            step_6: wait,
            default: wait,
        }
    }

    pub fn delay_for(&self, reply: &WorkerReply) -> Duration {
        match reply {
            WorkerReply::Step(1..=3) => self.steps_1_to_3,
            WorkerReply::Step(4) => self.step_4,
            WorkerReply::Step(5) => self.step_5,
            WorkerReply::Step(6) => self.step_6,
            WorkerReply::Step(_) | WorkerReply::Unrecognized(_) => self.default,
            WorkerReply::Done => Duration::ZERO,
        }
    }
}

impl Default for PollCadence {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    /// Replies received, including the final one
    pub replies: u32,
}

/// Client for one worker's status port.
#[derive(Debug, Clone)]
pub struct StatusPoller {
    addr: SocketAddr,
    cadence: PollCadence,
    retry_wait: Duration,
    io_timeout: Duration,
    max_failures: u32,
}

impl StatusPoller {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            cadence: PollCadence::STANDARD,
            retry_wait: DEFAULT_RETRY_WAIT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_failures: MAX_CONSECUTIVE_FAILURES,
        }
    }

    pub fn with_cadence(mut self, cadence: PollCadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Polls until the worker reports completion.
    ///
    /// `on_reply` sees every reply in order. Connection refusals before the
    /// first reply are retried indefinitely; after that, refusals and failed
    /// exchanges both count towards the consecutive failure cap.
    pub async fn run<F>(
        &self,
        control: &EngineControl,
        mut on_reply: F,
    ) -> Result<PollSummary, PollerError>
    where
        F: FnMut(&WorkerReply),
    {
        let port = self.port();
        let mut stream: Option<TcpStream> = None;
        let mut answered = false;
        let mut failures = 0u32;
        let mut replies = 0u32;

        loop {
            control.wait_while_paused().await?;

            if stream.is_none() {
                match control.run_until_shutdown(self.connect()).await? {
                    Ok(s) => stream = Some(s),
                    Err(e) => {
                        if answered {
                            failures += 1;
                            warn!(port, attempt = failures, error = %e, "Worker connection lost");
                            if failures >= self.max_failures {
                                return Err(PollerError::ReadFailures {
                                    port,
                                    attempts: failures,
                                    source: e,
                                });
                            }
                        } else {
                            trace!(port, error = %e, "Worker not listening yet");
                        }
                        control.sleep(self.retry_wait).await?;
                        continue;
                    }
                }
            }
            let Some(connected) = stream.as_mut() else {
                continue;
            };

            match control.run_until_shutdown(self.exchange(connected)).await? {
                Ok(text) => {
                    answered = true;
                    failures = 0;
                    replies += 1;

                    let reply = WorkerReply::parse(&text);
                    on_reply(&reply);
                    match &reply {
                        WorkerReply::Done => {
                            debug!(port, replies, "Worker reported completion");
                            return Ok(PollSummary { replies });
                        }
                        WorkerReply::Step(step) => debug!(port, step, "Worker progress"),
                        WorkerReply::Unrecognized(text) => {
                            warn!(port, reply = %text, "Unrecognized worker reply")
                        }
                    }
                    control.sleep(self.cadence.delay_for(&reply)).await?;
                }
                Err(e) => {
                    stream = None;
                    failures += 1;
                    warn!(port, attempt = failures, error = %e, "Status request failed");
                    if failures >= self.max_failures {
                        return Err(PollerError::ReadFailures {
                            port,
                            attempts: failures,
                            source: e,
                        });
                    }
                    control.sleep(self.retry_wait).await?;
                }
            }
        }
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.io_timeout, TcpStream::connect(self.addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    async fn exchange(&self, stream: &mut TcpStream) -> io::Result<String> {
        stream.write_all(STATUS_REQUEST).await?;
        let mut buf = [0u8; REPLY_BUFFER_SIZE];
        let n = match tokio::time::timeout(self.io_timeout, stream.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply")),
        };
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
        }
        Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const FAST: Duration = Duration::from_millis(5);

    fn fast_poller(port: u16) -> StatusPoller {
        StatusPoller::new(port)
            .with_cadence(PollCadence::uniform(FAST))
            .with_retry_wait(FAST)
            .with_io_timeout(Duration::from_secs(2))
    }

    /// Answers each `status` request with the next scripted reply.
    async fn scripted_worker(listener: TcpListener, replies: Vec<&'static str>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        for reply in replies {
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], STATUS_REQUEST);
            socket.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(WorkerReply::parse("Step 1 in process."), WorkerReply::Step(1));
        assert_eq!(WorkerReply::parse("Step 6 in process.\r\n"), WorkerReply::Step(6));
        assert_eq!(WorkerReply::parse(DONE_REPLY), WorkerReply::Done);
        assert_eq!(
            WorkerReply::parse("prefix Whole process done, socket closed. suffix"),
            WorkerReply::Done
        );
        assert_eq!(
            WorkerReply::parse("Step 7 in process."),
            WorkerReply::Unrecognized("Step 7 in process.".to_string())
        );
        assert!(matches!(WorkerReply::parse("hello"), WorkerReply::Unrecognized(_)));
    }

    #[test]
    fn test_standard_cadence() {
        let c = PollCadence::STANDARD;
        assert_eq!(c.delay_for(&WorkerReply::Step(1)), Duration::from_secs(15));
        assert_eq!(c.delay_for(&WorkerReply::Step(3)), Duration::from_secs(15));
        assert_eq!(c.delay_for(&WorkerReply::Step(4)), Duration::from_secs(10));
        assert_eq!(c.delay_for(&WorkerReply::Step(5)), Duration::from_secs(5));
        assert_eq!(c.delay_for(&WorkerReply::Step(6)), Duration::from_secs(1));
        assert_eq!(
            c.delay_for(&WorkerReply::Unrecognized("?".into())),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn test_session_runs_to_completion() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(scripted_worker(
            listener,
            vec![
                "Step 1 in process.",
                "Step 2 in process.",
                "working hard",
                "Step 6 in process.",
                DONE_REPLY,
            ],
        ));

        let control = EngineControl::new();
        let mut seen = Vec::new();
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            fast_poller(port).run(&control, |r| seen.push(r.clone())),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(summary.replies, 5);
        assert_eq!(seen.first(), Some(&WorkerReply::Step(1)));
        assert_eq!(seen.last(), Some(&WorkerReply::Done));
        assert!(matches!(seen[2], WorkerReply::Unrecognized(_)));
    }

    #[tokio::test]
    async fn test_waits_for_late_listener() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            scripted_worker(listener, vec![DONE_REPLY]).await;
        });

        let control = EngineControl::new();
        let summary = tokio::time::timeout(Duration::from_secs(5), fast_poller(port).run(&control, |_| {}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.replies, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_consecutive_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // First connection answers once, then every connection is closed
            // without a reply.
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"Step 1 in process.").await.unwrap();
            drop(socket);
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                drop(socket);
            }
        });

        let control = EngineControl::new();
        let result = tokio::time::timeout(Duration::from_secs(5), fast_poller(port).run(&control, |_| {}))
            .await
            .unwrap();
        match result {
            Err(PollerError::ReadFailures { attempts, .. }) => {
                assert_eq!(attempts, MAX_CONSECUTIVE_FAILURES)
            }
            other => panic!("expected read failures, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let control = EngineControl::new();
        let c = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.shutdown();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), fast_poller(port).run(&control, |_| {}))
            .await
            .unwrap();
        assert!(matches!(result, Err(PollerError::Shutdown(_))));
    }
}
