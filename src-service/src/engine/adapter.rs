//! One external decoding engine wrapped as a batch or streaming capability.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asrbridge_common::EngineMode;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::demux::TagDemux;
use super::error::EngineError;
use super::process::{self, EngineOutput};
use super::subscribers::{Subscribers, Subscription, SubscriptionId};
use crate::config::EngineConfig;

/// A batch decoding unit: a tag that correlates the answer, and the audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodingRequest {
    pub tag: String,
    pub audio_path: PathBuf,
}

impl DecodingRequest {
    pub fn new(tag: impl Into<String>, audio_path: impl Into<PathBuf>) -> Self {
        Self {
            tag: tag.into(),
            audio_path: audio_path.into(),
        }
    }

    /// Script line the engine reads: `<tag>\t<path>\n`.
    fn script_line(&self) -> String {
        format!("{}\t{}\n", self.tag, self.audio_path.display())
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.tag.is_empty() || self.tag.contains(char::is_whitespace) {
            return Err(EngineError::InvalidTag(self.tag.clone()));
        }
        Ok(())
    }
}

/// Normalize one line of streaming engine output into a hypothesis.
///
/// Lines of the form `<digits> <text>` have the utterance id stripped. When
/// `require_utterance_id` is set, lines without one are engine chatter and
/// are dropped.
pub fn normalize_stream_line(line: &str, require_utterance_id: bool) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some((id, rest)) = line.split_once(char::is_whitespace) {
        let rest = rest.trim_start();
        if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && !rest.is_empty() {
            return Some(rest);
        }
    }
    if require_utterance_id {
        None
    } else {
        Some(line)
    }
}

/// Owns one engine pipeline and its background output reader.
pub struct EngineAdapter {
    name: String,
    mode: EngineMode,
    config: EngineConfig,
    batch_timeout: Duration,
    /// Write side lock: interleaved writes would corrupt the engine's input
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    children: tokio::sync::Mutex<Vec<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    demux: Arc<TagDemux>,
    subscribers: Arc<Subscribers>,
    alive: Arc<AtomicBool>,
    terminated: AtomicBool,
}

impl EngineAdapter {
    /// Create an adapter. Nothing is spawned until [`initialize`](Self::initialize).
    pub fn new(
        name: impl Into<String>,
        mode: EngineMode,
        config: EngineConfig,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            config,
            batch_timeout,
            stdin: tokio::sync::Mutex::new(None),
            children: tokio::sync::Mutex::new(Vec::new()),
            reader: Mutex::new(None),
            demux: Arc::new(TagDemux::new()),
            subscribers: Arc::new(Subscribers::new()),
            alive: Arc::new(AtomicBool::new(false)),
            terminated: AtomicBool::new(false),
        }
    }

    /// Create and initialize in one step.
    pub async fn spawn(
        name: impl Into<String>,
        mode: EngineMode,
        config: EngineConfig,
        batch_timeout: Duration,
    ) -> Result<Arc<Self>, EngineError> {
        let adapter = Arc::new(Self::new(name, mode, config, batch_timeout));
        adapter.initialize().await?;
        Ok(adapter)
    }

    /// Spawn the engine pipeline and start the background output reader.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(EngineError::Terminated);
        }
        let mut stdin_slot = self.stdin.lock().await;
        if stdin_slot.is_some() {
            return Ok(());
        }

        let pipeline = process::spawn_pipeline(&self.config, &self.name)?;
        *stdin_slot = Some(pipeline.stdin);
        *self.children.lock().await = pipeline.children;
        self.alive.store(true, Ordering::SeqCst);

        let reader = OutputReader {
            name: self.name.clone(),
            mode: self.mode,
            require_utterance_id: self.config.require_utterance_id,
            demux: self.demux.clone(),
            subscribers: self.subscribers.clone(),
            alive: self.alive.clone(),
        };
        let handle = match pipeline.output {
            EngineOutput::Stdout(out) => tokio::spawn(reader.run(out)),
            EngineOutput::Stderr(err) => tokio::spawn(reader.run(err)),
        };
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(
            "[{}] Engine started in {:?} mode ({} stage(s))",
            self.name,
            self.mode,
            self.config.stages.len()
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Whether the engine is running and its output is still open.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Batch requests written but not yet answered.
    pub fn outstanding(&self) -> usize {
        self.demux.outstanding()
    }

    /// Submit a tagged unit and wait for the output line carrying its tag.
    ///
    /// The whole call (input lock, write and answer) is bounded by the
    /// configured batch timeout. The slot is released on every exit path so a
    /// late answer is simply discarded.
    pub async fn decode_batch(&self, request: &DecodingRequest) -> Result<String, EngineError> {
        if self.mode != EngineMode::Batch {
            return Err(EngineError::WrongMode(self.mode));
        }
        request.validate()?;
        if !self.is_alive() {
            return Err(EngineError::Terminated);
        }

        let deadline = Instant::now() + self.batch_timeout;
        let reply = self.demux.register(&request.tag)?;
        debug!("[{}] Decoding '{}'", self.name, request.tag);
        let answer = async {
            self.write_input(request.script_line().as_bytes()).await?;
            match reply.await {
                Ok(result) => result,
                // Slot dropped without an answer
                Err(_) => Err(EngineError::Terminated),
            }
        };

        match tokio::time::timeout_at(deadline, answer).await {
            Ok(Ok(hypothesis)) => Ok(hypothesis),
            Ok(Err(e)) => {
                self.demux.cancel(&request.tag);
                Err(e)
            }
            Err(_) => {
                self.demux.cancel(&request.tag);
                warn!(
                    "[{}] No answer for '{}' within {:?}",
                    self.name, request.tag, self.batch_timeout
                );
                Err(EngineError::Unresponsive {
                    tag: request.tag.clone(),
                    timeout: self.batch_timeout,
                })
            }
        }
    }

    /// Write one raw audio frame. Output arrives through subscribers.
    pub async fn decode_stream(&self, frame: &[u8]) -> Result<(), EngineError> {
        if self.mode != EngineMode::Stream {
            return Err(EngineError::WrongMode(self.mode));
        }
        if !self.is_alive() {
            return Err(EngineError::Terminated);
        }
        if frame.is_empty() {
            return Ok(());
        }
        self.write_input(frame).await
    }

    /// Receive every hypothesis line this engine emits from now on.
    pub fn subscribe(&self, capacity: usize) -> Subscription {
        self.subscribers.subscribe(capacity)
    }

    /// Stop forwarding output to a subscriber.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Stop the engine and join the reader. Safe to call more than once.
    ///
    /// Never waits on the input lock before the engine is signalled: a writer
    /// stuck on a full pipe keeps the lock until the engine is gone.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);

        // Closing stdin lets well-behaved engines finish on their own
        if let Ok(mut stdin) = self.stdin.try_lock() {
            stdin.take();
        }
        let children = std::mem::take(&mut *self.children.lock().await);
        process::shutdown(&self.name, children).await;
        drop(self.stdin.lock().await.take());

        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut handle) = reader {
            // A grandchild holding the output pipe open must not stall shutdown
            match tokio::time::timeout(process::TERMINATE_GRACE, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[{}] Output reader ended abnormally: {}", self.name, e),
                Err(_) => {
                    warn!("[{}] Engine output still open, abandoning reader", self.name);
                    handle.abort();
                }
            }
        }

        self.demux.fail_all();
        self.subscribers.close();
        info!("[{}] Engine terminated", self.name);
    }

    async fn write_input(&self, bytes: &[u8]) -> Result<(), EngineError> {
        let mut input = InputWrite {
            stdin: self.stdin.lock().await,
            name: &self.name,
            alive: &self.alive,
            finished: false,
        };
        input.write(bytes).await
    }
}

/// Exclusive hold on the engine's input for one write.
///
/// A write dropped part way (by a timeout or a cancelled session) leaves a
/// partial unit in the engine's input. The input is then closed and the
/// engine marked dead, since nothing written after it would parse.
struct InputWrite<'a> {
    stdin: tokio::sync::MutexGuard<'a, Option<ChildStdin>>,
    name: &'a str,
    alive: &'a AtomicBool,
    finished: bool,
}

impl InputWrite<'_> {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let result = match self.stdin.as_mut() {
            Some(stdin) => {
                async {
                    stdin.write_all(bytes).await?;
                    stdin.flush().await
                }
                .await
            }
            None => {
                self.finished = true;
                return Err(EngineError::Terminated);
            }
        };
        self.finished = true;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                warn!("[{}] Engine input closed", self.name);
                self.alive.store(false, Ordering::SeqCst);
                self.stdin.take();
                Err(EngineError::Terminated)
            }
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}

impl Drop for InputWrite<'_> {
    fn drop(&mut self) {
        if !self.finished && self.stdin.take().is_some() {
            warn!("[{}] Write abandoned part way, closing engine input", self.name);
            self.alive.store(false, Ordering::SeqCst);
        }
    }
}

/// State the background reader needs, detached from the adapter.
struct OutputReader {
    name: String,
    mode: EngineMode,
    require_utterance_id: bool,
    demux: Arc<TagDemux>,
    subscribers: Arc<Subscribers>,
    alive: Arc<AtomicBool>,
}

impl OutputReader {
    async fn run<R>(self, output: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(output);
        let mut raw = Vec::new();

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    self.handle_line(&line);
                }
                Err(e) => {
                    warn!("[{}] Failed to read engine output: {}", self.name, e);
                    break;
                }
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        let failed = self.demux.fail_all();
        self.subscribers.close();
        if failed > 0 {
            warn!(
                "[{}] Engine output closed, failed {} pending request(s)",
                self.name, failed
            );
        } else {
            info!("[{}] Engine output closed", self.name);
        }
    }

    fn handle_line(&self, line: &str) {
        match self.mode {
            EngineMode::Batch => {
                if !self.demux.dispatch_line(line) {
                    debug!("[{}] Unmatched output: {}", self.name, line.trim_end());
                }
            }
            EngineMode::Stream => {
                if let Some(hypothesis) = normalize_stream_line(line, self.require_utterance_id) {
                    debug!("[{}] Decoded: {}", self.name, hypothesis);
                    self.subscribers.publish(hypothesis);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_lines_lose_their_utterance_id() {
        assert_eq!(normalize_stream_line("12 ala ma kota\n", true), Some("ala ma kota"));
        assert_eq!(normalize_stream_line("ala ma kota", false), Some("ala ma kota"));
        assert_eq!(normalize_stream_line("LOG decoder ready", true), None);
        assert_eq!(normalize_stream_line("   \n", false), None);
        assert_eq!(normalize_stream_line("7", false), Some("7"));
    }

    #[test]
    fn script_line_is_tab_separated() {
        let request = DecodingRequest::new("abc", "/tmp/abc.wav");
        assert_eq!(request.script_line(), "abc\t/tmp/abc.wav\n");
        assert!(DecodingRequest::new("has space", "/x").validate().is_err());
        assert!(DecodingRequest::new("", "/x").validate().is_err());
    }

    #[cfg(unix)]
    mod process_tests {
        use super::super::*;
        use crate::config::{CommandSpec, OutputStream};

        fn sh(script: &str) -> EngineConfig {
            EngineConfig::single(CommandSpec::new("/bin/sh", &["-c", script]))
        }

        /// Answers `<tag> OK` for each request line.
        const ECHO_OK: &str = r#"while read -r tag rest; do echo "$tag OK"; done"#;

        #[tokio::test]
        async fn batch_request_returns_tagged_answer() {
            let engine = EngineAdapter::spawn(
                "echo",
                EngineMode::Batch,
                sh(ECHO_OK),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

            let request = DecodingRequest::new("req-1", "/tmp/frame.raw");
            let hypothesis = engine.decode_batch(&request).await.unwrap();
            assert_eq!(hypothesis, "OK");
            assert_eq!(engine.outstanding(), 0);
            engine.terminate().await;
        }

        #[tokio::test]
        async fn concurrent_requests_do_not_cross_talk() {
            // Answers arrive in reverse order of submission
            let script = r#"
                read -r t1 p1; read -r t2 p2; read -r t3 p3
                echo "$t3 third $p3"; echo "noise line"; echo "$t1 first $p1"; echo "$t2 second $p2"
                cat > /dev/null
            "#;
            let engine =
                EngineAdapter::spawn("rev", EngineMode::Batch, sh(script), Duration::from_secs(5))
                    .await
                    .unwrap();

            let (ra, rb, rc) = (
                DecodingRequest::new("a", "/a"),
                DecodingRequest::new("b", "/b"),
                DecodingRequest::new("c", "/c"),
            );
            let (a, b, c) = tokio::join!(
                engine.decode_batch(&ra),
                engine.decode_batch(&rb),
                engine.decode_batch(&rc),
            );
            // Write order between the three callers is unspecified, the
            // path in each answer shows which request it belongs to
            let answers = [a.unwrap(), b.unwrap(), c.unwrap()];
            assert!(answers[0].ends_with("/a"));
            assert!(answers[1].ends_with("/b"));
            assert!(answers[2].ends_with("/c"));
            engine.terminate().await;
        }

        #[tokio::test]
        async fn silent_engine_times_out_and_frees_the_tag() {
            let engine = EngineAdapter::spawn(
                "mute",
                EngineMode::Batch,
                sh("cat > /dev/null"),
                Duration::from_millis(200),
            )
            .await
            .unwrap();

            let request = DecodingRequest::new("slow", "/slow");
            let result = engine.decode_batch(&request).await;
            assert!(matches!(result, Err(EngineError::Unresponsive { .. })));
            assert_eq!(engine.outstanding(), 0);
            assert!(engine.is_alive());
            engine.terminate().await;
        }

        #[tokio::test]
        async fn engine_exit_fails_all_pending_requests() {
            // Consume the requests, then die without answering
            let script = "read -r a; read -r b; read -r c; exit 1";
            let engine =
                EngineAdapter::spawn("dies", EngineMode::Batch, sh(script), Duration::from_secs(10))
                    .await
                    .unwrap();

            let started = std::time::Instant::now();
            let (r1, r2, r3) = (
                DecodingRequest::new("x1", "/1"),
                DecodingRequest::new("x2", "/2"),
                DecodingRequest::new("x3", "/3"),
            );
            let (a, b, c) = tokio::join!(
                engine.decode_batch(&r1),
                engine.decode_batch(&r2),
                engine.decode_batch(&r3),
            );
            for result in [a, b, c] {
                assert!(matches!(result, Err(EngineError::Terminated)));
            }
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(!engine.is_alive());
        }

        #[tokio::test]
        async fn stream_output_reaches_subscribers_in_order() {
            // Emits one numbered hypothesis per input line
            let script = r#"n=0; while read -r chunk; do n=$((n+1)); echo "$n heard $chunk"; done"#;
            let mut config = sh(script);
            config.require_utterance_id = true;
            let engine =
                EngineAdapter::spawn("live", EngineMode::Stream, config, Duration::from_secs(1))
                    .await
                    .unwrap();

            let mut sub = engine.subscribe(16);
            engine.decode_stream(b"one\n").await.unwrap();
            engine.decode_stream(b"two\n").await.unwrap();

            assert_eq!(sub.receiver.recv().await.as_deref(), Some("heard one"));
            assert_eq!(sub.receiver.recv().await.as_deref(), Some("heard two"));

            assert!(engine.unsubscribe(sub.id));
            engine.terminate().await;
            assert_eq!(sub.receiver.recv().await, None);
        }

        #[tokio::test]
        async fn pipeline_stages_and_stderr_output() {
            let config = EngineConfig {
                stages: vec![
                    CommandSpec::new("/bin/sh", &["-c", r#"while read -r t p; do echo "$t upper"; done"#]),
                    CommandSpec::new("/bin/sh", &["-c", r#"while read -r t w; do echo "$t $w-done" >&2; done"#]),
                ],
                output: OutputStream::Stderr,
                require_utterance_id: false,
            };
            let engine =
                EngineAdapter::spawn("chain", EngineMode::Batch, config, Duration::from_secs(5))
                    .await
                    .unwrap();

            let answer = engine
                .decode_batch(&DecodingRequest::new("p1", "/p1.wav"))
                .await
                .unwrap();
            assert_eq!(answer, "upper-done");
            engine.terminate().await;
        }

        /// Never reads its input, so a large write fills the pipe and stalls.
        const DEAF: &str = "exec sleep 30";

        #[tokio::test]
        async fn terminate_unblocks_a_stalled_stream_write() {
            let engine =
                EngineAdapter::spawn("deaf", EngineMode::Stream, sh(DEAF), Duration::from_secs(1))
                    .await
                    .unwrap();

            let writer = {
                let engine = engine.clone();
                tokio::spawn(async move { engine.decode_stream(&vec![0u8; 1 << 20]).await })
            };
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(!writer.is_finished());

            tokio::time::timeout(Duration::from_secs(5), engine.terminate())
                .await
                .expect("terminate stalled behind the blocked write");
            let written = tokio::time::timeout(Duration::from_secs(5), writer)
                .await
                .expect("blocked write was not released")
                .unwrap();
            assert!(matches!(written, Err(EngineError::Terminated)));
            assert!(!engine.is_alive());
        }

        #[tokio::test]
        async fn batch_timeout_covers_a_stalled_write() {
            let engine = EngineAdapter::spawn(
                "deaf-batch",
                EngineMode::Batch,
                sh(DEAF),
                Duration::from_millis(200),
            )
            .await
            .unwrap();

            let request = DecodingRequest::new("huge", "x".repeat(1 << 20));
            let result = tokio::time::timeout(Duration::from_secs(5), engine.decode_batch(&request))
                .await
                .expect("batch call outlived its timeout");
            assert!(matches!(result, Err(EngineError::Unresponsive { .. })));
            assert_eq!(engine.outstanding(), 0);
            // The half-written request poisons the input stream
            assert!(!engine.is_alive());
            engine.terminate().await;
        }

        #[tokio::test]
        async fn modes_are_enforced_and_terminate_is_idempotent() {
            let engine =
                EngineAdapter::spawn("modes", EngineMode::Stream, sh("cat > /dev/null"), Duration::from_secs(1))
                    .await
                    .unwrap();
            assert!(matches!(
                engine.decode_batch(&DecodingRequest::new("t", "/t")).await,
                Err(EngineError::WrongMode(EngineMode::Stream))
            ));

            engine.terminate().await;
            engine.terminate().await;
            assert!(!engine.is_alive());
            assert!(matches!(
                engine.decode_stream(b"late").await,
                Err(EngineError::Terminated)
            ));
        }
    }
}
