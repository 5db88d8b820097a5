//! Forwarding of an interactive job's standard streams over one call.
//!
//! Two blocking pumps read the job's stdout and stderr and emit tagged
//! messages through a shared outlet. The outlet serializes emission and
//! counts finished pumps; the response stream ends once both have reached
//! end of stream. Client input is written to the job's stdin in order by a
//! blocking writer, and stdin is closed when the client ends or aborts its
//! side of the call.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use skiff::{ByteSink, ByteSource, InteractiveStreams, JobDescription, Scheduler};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use crate::error::GatewayError;
use crate::proto::{Job, SubmitInteractiveJobRequest, SubmitInteractiveJobResponse};

/// Responses buffered before a pump has to wait for the client.
const OUTPUT_BACKLOG: usize = 16;
/// Input chunks buffered before the client has to wait for the job.
const INPUT_BACKLOG: usize = 16;

/// Stream of responses sent to the client of an interactive job.
pub type OutputStream = ReceiverStream<Result<SubmitInteractiveJobResponse, Status>>;

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    fn name(self) -> &'static str {
        match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        }
    }

    fn response(self, bytes: Vec<u8>) -> SubmitInteractiveJobResponse {
        match self {
            Channel::Stdout => SubmitInteractiveJobResponse {
                job: None,
                stdout: bytes,
                stderr: Vec::new(),
            },
            Channel::Stderr => SubmitInteractiveJobResponse {
                job: None,
                stdout: Vec::new(),
                stderr: bytes,
            },
        }
    }
}

/// Shared end of the response channel used by both pumps.
struct Outlet {
    tx: Option<mpsc::Sender<Result<SubmitInteractiveJobResponse, Status>>>,
    finished: u8,
    done: Option<oneshot::Sender<()>>,
}

impl Outlet {
    /// Send one message. Once the client is gone later messages are dropped.
    fn emit(&mut self, message: Result<SubmitInteractiveJobResponse, Status>) {
        if let Some(tx) = &self.tx
            && tx.blocking_send(message).is_err()
        {
            tracing::debug!("client left interactive job, discarding output");
            self.tx = None;
        }
    }

    /// Record a finished pump. The second one ends the response stream.
    fn finish(&mut self) {
        self.finished += 1;
        if self.finished == 2 {
            self.tx = None;
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
        }
    }
}

fn lock(outlet: &Mutex<Outlet>) -> MutexGuard<'_, Outlet> {
    outlet.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Submit `description` as an interactive job and forward its streams.
///
/// `inbound` is the rest of the client stream after the message that carried
/// `description`; `first_input` is the stdin carried by that message. The
/// first response carries the job id. Failure to start the job fails the call
/// before any response is sent.
pub async fn forward<St>(
    scheduler: Arc<dyn Scheduler>,
    description: JobDescription,
    first_input: Vec<u8>,
    inbound: St,
    chunk_size: usize,
) -> Result<(String, OutputStream), Status>
where
    St: Stream<Item = Result<SubmitInteractiveJobRequest, Status>> + Send + Unpin + 'static,
{
    let streams = tokio::task::spawn_blocking(move || scheduler.submit_interactive_job(&description))
        .await
        .map_err(GatewayError::from)?
        .map_err(GatewayError::from)?;
    let InteractiveStreams {
        job_id,
        stdin,
        stdout,
        stderr,
    } = streams;
    tracing::info!(%job_id, "interactive job started");

    let (tx, rx) = mpsc::channel(OUTPUT_BACKLOG);
    let first = SubmitInteractiveJobResponse {
        job: Some(Job { id: job_id.clone() }),
        stdout: Vec::new(),
        stderr: Vec::new(),
    };
    if tx.send(Ok(first)).await.is_err() {
        tracing::debug!(%job_id, "client left before the job id was sent");
    }

    let (done_tx, done_rx) = oneshot::channel();
    let outlet = Arc::new(Mutex::new(Outlet {
        tx: Some(tx),
        finished: 0,
        done: Some(done_tx),
    }));
    for (channel, source) in [(Channel::Stdout, stdout), (Channel::Stderr, stderr)] {
        let outlet = Arc::clone(&outlet);
        let job_id = job_id.clone();
        tokio::task::spawn_blocking(move || pump_output(&job_id, channel, source, chunk_size, &outlet));
    }

    let (input_tx, input_rx) = mpsc::channel(INPUT_BACKLOG);
    {
        let job_id = job_id.clone();
        tokio::task::spawn_blocking(move || drain_input(&job_id, stdin, first_input, input_rx));
    }
    tokio::spawn(feed_input(job_id.clone(), inbound, input_tx, done_rx));

    Ok((job_id, ReceiverStream::new(rx)))
}

fn pump_output(
    job_id: &str,
    channel: Channel,
    mut source: Box<dyn ByteSource>,
    chunk_size: usize,
    outlet: &Mutex<Outlet>,
) {
    let mut buffer = vec![0u8; chunk_size];
    loop {
        match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => lock(outlet).emit(Ok(channel.response(buffer[..n].to_vec()))),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(%job_id, stream = channel.name(), error = %err, "reading job output failed");
                let status = GatewayError::from(skiff::AdaptorError::Io(err));
                let mut outlet = lock(outlet);
                outlet.emit(Err(status.into()));
                outlet.tx = None;
                break;
            }
        }
    }
    if let Err(err) = source.close() {
        tracing::warn!(%job_id, stream = channel.name(), error = %err, "failed to close job output");
    }
    tracing::debug!(%job_id, stream = channel.name(), "output reached end of stream");
    lock(outlet).finish();
}

fn drain_input(
    job_id: &str,
    mut sink: Box<dyn ByteSink>,
    first: Vec<u8>,
    mut chunks: mpsc::Receiver<Vec<u8>>,
) {
    let written = write_input(&mut sink, first, &mut chunks);
    chunks.close();
    if let Err(err) = written {
        // Usually the job exited and closed its end of the pipe.
        tracing::debug!(%job_id, error = %err, "stopped writing job input");
    }
    if let Err(err) = sink.close() {
        tracing::debug!(%job_id, error = %err, "failed to close job input");
    }
}

fn write_input(
    sink: &mut Box<dyn ByteSink>,
    first: Vec<u8>,
    chunks: &mut mpsc::Receiver<Vec<u8>>,
) -> io::Result<()> {
    if !first.is_empty() {
        sink.write_all(&first)?;
        sink.flush()?;
    }
    while let Some(chunk) = chunks.blocking_recv() {
        sink.write_all(&chunk)?;
        sink.flush()?;
    }
    Ok(())
}

async fn feed_input<St>(
    job_id: String,
    mut inbound: St,
    input_tx: mpsc::Sender<Vec<u8>>,
    mut done: oneshot::Receiver<()>,
) where
    St: Stream<Item = Result<SubmitInteractiveJobRequest, Status>> + Unpin,
{
    loop {
        tokio::select! {
            _ = &mut done => {
                tracing::debug!(%job_id, "job output exhausted, closing input");
                break;
            }
            next = inbound.next() => match next {
                Some(Ok(message)) => {
                    if message.stdin.is_empty() {
                        continue;
                    }
                    if input_tx.send(message.stdin).await.is_err() {
                        tracing::debug!(%job_id, "job no longer accepts input");
                    }
                }
                Some(Err(status)) => {
                    tracing::info!(%job_id, %status, "client aborted interactive job");
                    break;
                }
                None => {
                    tracing::debug!(%job_id, "client finished sending input");
                    break;
                }
            }
        }
    }
    // Dropping the sender closes the job's stdin.
    drop(input_tx);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use skiff::{AdaptorResult, Credential, FileSystem, JobStatus, LocalScheduler, QueueStatus, Session};

    /// Sink that records what was written and whether it was closed.
    #[derive(Clone, Default)]
    struct Recorder {
        written: Arc<Mutex<Vec<u8>>>,
        closed: Arc<AtomicBool>,
    }

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ByteSink for Recorder {
        fn close(self: Box<Self>) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Scheduler whose single interactive job has canned output.
    #[derive(Debug)]
    struct CannedScheduler {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        properties: BTreeMap<String, String>,
        stdin: Mutex<Option<Recorder>>,
    }

    impl std::fmt::Debug for Recorder {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Recorder").finish_non_exhaustive()
        }
    }

    impl Session for CannedScheduler {
        fn adaptor_name(&self) -> &str {
            "canned"
        }
        fn location(&self) -> &str {
            ""
        }
        fn properties(&self) -> &BTreeMap<String, String> {
            &self.properties
        }
        fn is_open(&self) -> bool {
            true
        }
        fn close(&self) -> AdaptorResult<()> {
            Ok(())
        }
    }

    impl Scheduler for CannedScheduler {
        fn queue_names(&self) -> AdaptorResult<Vec<String>> {
            Ok(Vec::new())
        }
        fn default_queue_name(&self) -> AdaptorResult<String> {
            Ok(String::new())
        }
        fn queue_status(&self, queue: &str) -> AdaptorResult<QueueStatus> {
            Err(skiff::AdaptorError::NoSuchQueue(queue.to_string()))
        }
        fn queue_statuses(&self, _queues: &[String]) -> AdaptorResult<Vec<QueueStatus>> {
            Ok(Vec::new())
        }
        fn jobs(&self, _queues: &[String]) -> AdaptorResult<Vec<String>> {
            Ok(Vec::new())
        }
        fn submit_batch_job(&self, _description: &JobDescription) -> AdaptorResult<String> {
            Err(skiff::AdaptorError::unsupported("canned", "batch jobs"))
        }
        fn submit_interactive_job(
            &self,
            description: &JobDescription,
        ) -> AdaptorResult<InteractiveStreams> {
            if description.executable.is_empty() {
                return Err(skiff::AdaptorError::IncompleteJobDescription(
                    "executable".to_string(),
                ));
            }
            let recorder = Recorder::default();
            *self.stdin.lock().unwrap() = Some(recorder.clone());
            Ok(InteractiveStreams {
                job_id: "canned-1".to_string(),
                stdin: Box::new(recorder),
                stdout: Box::new(Cursor::new(self.stdout.clone())),
                stderr: Box::new(Cursor::new(self.stderr.clone())),
            })
        }
        fn job_status(&self, job_id: &str) -> AdaptorResult<JobStatus> {
            Err(skiff::AdaptorError::NoSuchJob(job_id.to_string()))
        }
        fn job_statuses(&self, _job_ids: &[String]) -> Vec<JobStatus> {
            Vec::new()
        }
        fn cancel_job(&self, job_id: &str) -> AdaptorResult<JobStatus> {
            Err(skiff::AdaptorError::NoSuchJob(job_id.to_string()))
        }
        fn wait_until_done(&self, job_id: &str, _timeout: Duration) -> AdaptorResult<JobStatus> {
            Err(skiff::AdaptorError::NoSuchJob(job_id.to_string()))
        }
        fn wait_until_running(&self, job_id: &str, _timeout: Duration) -> AdaptorResult<JobStatus> {
            Err(skiff::AdaptorError::NoSuchJob(job_id.to_string()))
        }
        fn file_system(&self) -> AdaptorResult<Arc<dyn FileSystem>> {
            Err(skiff::AdaptorError::unsupported("canned", "file systems"))
        }
    }

    fn canned(stdout: &[u8], stderr: &[u8]) -> Arc<CannedScheduler> {
        Arc::new(CannedScheduler {
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
            properties: BTreeMap::new(),
            stdin: Mutex::new(None),
        })
    }

    fn input(bytes: &[u8]) -> Result<SubmitInteractiveJobRequest, Status> {
        Ok(SubmitInteractiveJobRequest {
            stdin: bytes.to_vec(),
            ..Default::default()
        })
    }

    fn description(executable: &str) -> JobDescription {
        JobDescription {
            executable: executable.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_both_streams_delivered_before_completion() {
        let scheduler = canned(&vec![b'o'; 2500], b"oops");
        let (job_id, responses) = forward(
            scheduler.clone(),
            description("canned"),
            Vec::new(),
            tokio_stream::empty::<Result<SubmitInteractiveJobRequest, Status>>(),
            1024,
        )
        .await
        .unwrap();
        assert_eq!(job_id, "canned-1");

        let responses: Vec<_> = responses.map(|r| r.unwrap()).collect().await;
        assert_eq!(responses[0].job.as_ref().unwrap().id, "canned-1");
        let stdout: Vec<u8> = responses.iter().flat_map(|r| r.stdout.clone()).collect();
        let stderr: Vec<u8> = responses.iter().flat_map(|r| r.stderr.clone()).collect();
        assert_eq!(stdout.len(), 2500);
        assert_eq!(stderr, b"oops");
        for response in &responses[1..] {
            assert!(response.job.is_none());
            assert!(response.stdout.is_empty() != response.stderr.is_empty());
            assert!(response.stdout.len() <= 1024);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_input_written_in_order_then_closed() {
        let scheduler = canned(b"", b"");
        let inbound = tokio_stream::iter(vec![input(b"two\n"), input(b""), input(b"three\n")]);
        let (_, responses) = forward(
            scheduler.clone(),
            description("canned"),
            b"one\n".to_vec(),
            inbound,
            1024,
        )
        .await
        .unwrap();
        let _: Vec<_> = responses.collect().await;

        let recorder = scheduler.stdin.lock().unwrap().clone().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !recorder.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(&*recorder.written.lock().unwrap(), b"one\ntwo\nthree\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_failure_fails_call() {
        let scheduler = canned(b"", b"");
        let status = forward(
            scheduler,
            description(""),
            Vec::new(),
            tokio_stream::empty::<Result<SubmitInteractiveJobRequest, Status>>(),
            1024,
        )
        .await
        .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_echo_through_local_scheduler() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(
            LocalScheduler::open("", &Credential::default(), &BTreeMap::new()).unwrap(),
        );
        let (input_tx, input_rx) = mpsc::channel(4);
        let (_, mut responses) = forward(
            Arc::clone(&scheduler),
            description("cat"),
            Vec::new(),
            ReceiverStream::new(input_rx),
            1024,
        )
        .await
        .unwrap();
        let first = responses.next().await.unwrap().unwrap();
        assert!(first.job.is_some());

        let mut echoed = Vec::new();
        for line in [&b"first\n"[..], &b"second\n"[..]] {
            input_tx.send(input(line)).await.unwrap();
            let response = tokio::time::timeout(Duration::from_secs(10), responses.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            echoed.push(response.stdout);
        }
        drop(input_tx);

        let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(10), responses.collect::<Vec<_>>())
            .await
            .unwrap();
        assert!(rest.iter().all(|r| r.as_ref().unwrap().stdout.is_empty()));
        assert_eq!(echoed, vec![b"first\n".to_vec(), b"second\n".to_vec()]);
        scheduler.close().unwrap();
    }
}
