//! Chunked transfer between blocking file streams and wire messages.
//!
//! Reads open one [`ByteSource`] and pump fixed-size chunks to the client on
//! a blocking thread. The stream of chunks always ends with an empty chunk
//! or, on failure, with the error. Writes and appends open one [`ByteSink`]
//! when the first message arrives and hand every chunk to a blocking writer
//! in arrival order.

use std::io::{self, Write};
use std::sync::Arc;

use skiff::stream::read_full;
use skiff::{AdaptorError, AdaptorResult, ByteSink, ByteSource, FileSystem, RemotePath};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use crate::convert;
use crate::deadline;
use crate::error::GatewayError;
use crate::proto::{self, AppendToFileRequest, ReadFromFileResponse, WriteToFileRequest};
use crate::registry::HandleRegistry;

/// Chunks buffered between the wire and the blocking side.
const CHUNK_BACKLOG: usize = 4;

/// Stream of file content chunks sent to the client.
pub type ChunkStream = ReceiverStream<Result<ReadFromFileResponse, Status>>;

/// Open `path` on `fs` and stream its content in chunks of `chunk_size`.
///
/// Opening happens before this returns, so a missing file fails the call
/// itself. Later failures end the stream with an error.
pub async fn send_file(
    fs: Arc<dyn FileSystem>,
    path: RemotePath,
    chunk_size: usize,
    deadline: Option<Instant>,
) -> Result<ChunkStream, Status> {
    let opened = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || fs.read_from_file(&path))
            .await
            .map_err(GatewayError::from)?
    };
    let source = opened.map_err(GatewayError::from)?;

    let (tx, rx) = mpsc::channel(CHUNK_BACKLOG);
    tokio::task::spawn_blocking(move || pump_source(source, &path, chunk_size, deadline, &tx));
    Ok(ReceiverStream::new(rx))
}

fn pump_source(
    mut source: Box<dyn ByteSource>,
    path: &RemotePath,
    chunk_size: usize,
    deadline: Option<Instant>,
    tx: &mpsc::Sender<Result<ReadFromFileResponse, Status>>,
) {
    let pumped = pump_chunks(&mut source, path, chunk_size, deadline, tx);
    let closed = source.close();

    let last = match (pumped, closed) {
        (Pumped::Finished, Ok(())) => Ok(ReadFromFileResponse { buffer: Vec::new() }),
        (Pumped::Finished, Err(err)) => Err(io_status(err, path)),
        (Pumped::Failed(status), closed) => {
            if let Err(err) = closed {
                tracing::warn!(%path, error = %err, "failed to close file after read error");
            }
            Err(status)
        }
        (Pumped::ClientGone, _) => {
            tracing::debug!(%path, "client stopped reading");
            return;
        }
    };
    if let Err(status) = &last {
        tracing::debug!(%path, %status, "read ended with error");
    }
    // The client may have left between the last chunk and now.
    let _ = tx.blocking_send(last);
}

enum Pumped {
    Finished,
    Failed(Status),
    ClientGone,
}

fn pump_chunks(
    source: &mut Box<dyn ByteSource>,
    path: &RemotePath,
    chunk_size: usize,
    deadline: Option<Instant>,
    tx: &mpsc::Sender<Result<ReadFromFileResponse, Status>>,
) -> Pumped {
    loop {
        if deadline::expired(deadline) {
            return Pumped::Failed(Status::deadline_exceeded(format!(
                "deadline passed while reading {path}"
            )));
        }
        let mut buffer = vec![0u8; chunk_size];
        let n = match read_full(source, &mut buffer) {
            Ok(n) => n,
            Err(err) => return Pumped::Failed(io_status(err, path)),
        };
        if n == 0 {
            return Pumped::Finished;
        }
        buffer.truncate(n);
        if tx.blocking_send(Ok(ReadFromFileResponse { buffer })).is_err() {
            return Pumped::ClientGone;
        }
        if n < chunk_size {
            return Pumped::Finished;
        }
    }
}

fn io_status(err: io::Error, path: &RemotePath) -> Status {
    GatewayError::from(AdaptorError::from_io(err, &path.to_string())).into()
}

/// A message of a client-streamed upload.
///
/// Only the first message of a call names the destination; later messages
/// carry bytes only.
pub trait ChunkMessage: Send + 'static {
    /// Handle id and destination path, if this message carries them.
    fn target(&self) -> Option<(&str, &proto::Path)>;

    /// Open the destination named by the first message.
    fn open(&self, fs: &dyn FileSystem, path: &RemotePath) -> AdaptorResult<Box<dyn ByteSink>>;

    /// Bytes carried by this message.
    fn into_buffer(self) -> Vec<u8>;
}

impl ChunkMessage for WriteToFileRequest {
    fn target(&self) -> Option<(&str, &proto::Path)> {
        Some((self.filesystem.as_ref()?.id.as_str(), self.path.as_ref()?))
    }

    fn open(&self, fs: &dyn FileSystem, path: &RemotePath) -> AdaptorResult<Box<dyn ByteSink>> {
        fs.write_to_file(path, (self.size > 0).then_some(self.size))
    }

    fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

impl ChunkMessage for AppendToFileRequest {
    fn target(&self) -> Option<(&str, &proto::Path)> {
        Some((self.filesystem.as_ref()?.id.as_str(), self.path.as_ref()?))
    }

    fn open(&self, fs: &dyn FileSystem, path: &RemotePath) -> AdaptorResult<Box<dyn ByteSink>> {
        fs.append_to_file(path)
    }

    fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

/// Receive an upload from `inbound` and write it to the file it names.
///
/// The destination is opened exactly once, even when no bytes follow, and is
/// closed on every path. Success is only reported once the client has ended
/// its stream and the file has been closed without error.
pub async fn receive_file<M, St>(
    file_systems: &HandleRegistry<dyn FileSystem>,
    mut inbound: St,
    deadline: Option<Instant>,
) -> Result<(), Status>
where
    M: ChunkMessage,
    St: Stream<Item = Result<M, Status>> + Unpin,
{
    let first = match next_message(&mut inbound, deadline).await? {
        Some(first) => first,
        None => {
            return Err(Status::invalid_argument(
                "stream closed before the first chunk",
            ));
        }
    };
    let (fs, path) = {
        let (id, path) = first.target().ok_or_else(|| {
            Status::invalid_argument("first chunk must carry filesystem and path")
        })?;
        (file_systems.get(id)?, convert::remote_path(path)?)
    };
    tracing::debug!(%path, "receiving file");

    let (tx, rx) = mpsc::channel(CHUNK_BACKLOG);
    let writer = tokio::task::spawn_blocking(move || drain_into(fs.as_ref(), &path, first, rx));

    let ended = loop {
        match next_message(&mut inbound, deadline).await {
            Ok(Some(message)) => {
                if tx.send(message.into_buffer()).await.is_err() {
                    // Writer gave up; its result carries the reason.
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(status) => break Err(status),
        }
    };
    drop(tx);

    let written = writer.await.map_err(GatewayError::from)?;
    match (ended, written) {
        (Ok(()), written) => written.map_err(Status::from),
        (Err(status), written) => {
            if let Err(err) = written {
                tracing::warn!(error = %err, "write failed after upload was aborted");
            }
            Err(status)
        }
    }
}

async fn next_message<M, St>(inbound: &mut St, deadline: Option<Instant>) -> Result<Option<M>, Status>
where
    St: Stream<Item = Result<M, Status>> + Unpin,
{
    let next = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, inbound.next())
            .await
            .map_err(|_| Status::deadline_exceeded("deadline passed while receiving chunks"))?,
        None => inbound.next().await,
    };
    match next {
        Some(Ok(message)) => Ok(Some(message)),
        Some(Err(status)) => {
            tracing::debug!(%status, "client aborted upload");
            Err(Status::cancelled(format!("upload aborted: {}", status.message())))
        }
        None => Ok(None),
    }
}

fn drain_into<M: ChunkMessage>(
    fs: &dyn FileSystem,
    path: &RemotePath,
    first: M,
    mut chunks: mpsc::Receiver<Vec<u8>>,
) -> Result<(), GatewayError> {
    let mut sink = first.open(fs, path)?;
    let written = write_chunks(&mut sink, first.into_buffer(), &mut chunks);
    // Stop accepting chunks before the potentially slow close.
    chunks.close();
    let closed = sink.close();

    match (written, closed) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(err)) => Err(AdaptorError::from_io(err, &path.to_string()).into()),
        (Err(err), closed) => {
            if let Err(close_err) = closed {
                tracing::warn!(%path, error = %close_err, "failed to close file after write error");
            }
            Err(AdaptorError::from_io(err, &path.to_string()).into())
        }
    }
}

fn write_chunks(
    sink: &mut Box<dyn ByteSink>,
    first: Vec<u8>,
    chunks: &mut mpsc::Receiver<Vec<u8>>,
) -> io::Result<()> {
    sink.write_all(&first)?;
    while let Some(chunk) = chunks.blocking_recv() {
        sink.write_all(&chunk)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::{HandleKind, SessionRequest};
    use skiff::{Credential, LocalFileSystem};
    use std::collections::BTreeMap;
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tonic::Code;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: HandleRegistry<dyn FileSystem>,
        fs: Arc<dyn FileSystem>,
        id: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().to_string_lossy().to_string();
        let fs: Arc<dyn FileSystem> = Arc::new(
            LocalFileSystem::open(&location, &Credential::default(), &BTreeMap::new()).unwrap(),
        );
        let registry = HandleRegistry::new(HandleKind::FileSystem);
        let request = SessionRequest {
            adaptor: "file".to_string(),
            location,
            credential: Credential::default(),
            properties: BTreeMap::new(),
        };
        let id = registry.put(request, Arc::clone(&fs)).unwrap();
        Fixture {
            _dir: dir,
            registry,
            fs,
            id,
        }
    }

    fn write(id: &str, path: &str, buffer: &[u8]) -> Result<WriteToFileRequest, Status> {
        Ok(WriteToFileRequest {
            filesystem: Some(proto::FileSystem {
                id: id.to_string(),
                request: None,
            }),
            path: Some(proto::Path {
                path: path.to_string(),
                separator: String::new(),
            }),
            size: 0,
            buffer: buffer.to_vec(),
        })
    }

    fn chunk(buffer: &[u8]) -> Result<WriteToFileRequest, Status> {
        Ok(WriteToFileRequest {
            buffer: buffer.to_vec(),
            ..Default::default()
        })
    }

    async fn read_all(fx: &Fixture, path: &str, chunk_size: usize) -> Vec<Result<Vec<u8>, Status>> {
        let stream = send_file(Arc::clone(&fx.fs), RemotePath::new(path), chunk_size, None)
            .await
            .unwrap();
        stream.map(|r| r.map(|m| m.buffer)).collect().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_then_read_in_chunks() {
        let fx = fixture();
        let inbound = tokio_stream::iter(vec![
            write(&fx.id, "/data.bin", b"hello "),
            chunk(b"chunked "),
            chunk(b""),
            chunk(b"world"),
        ]);
        receive_file(&fx.registry, inbound, None).await.unwrap();

        let chunks = read_all(&fx, "/data.bin", 4).await;
        let last = chunks.last().unwrap().as_ref().unwrap();
        assert!(last.is_empty(), "stream must end with an empty chunk");
        let content: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap()).collect();
        assert_eq!(content, b"hello chunked world");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_chunk_write_creates_empty_file() {
        let fx = fixture();
        let inbound = tokio_stream::iter(vec![write(&fx.id, "/empty", b"")]);
        receive_file(&fx.registry, inbound, None).await.unwrap();

        let attributes = fx.fs.get_attributes(&RemotePath::new("/empty")).unwrap();
        assert!(attributes.is_regular_file);
        assert_eq!(attributes.size, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_append_extends_file() {
        let fx = fixture();
        let inbound = tokio_stream::iter(vec![write(&fx.id, "/log", b"one\n")]);
        receive_file(&fx.registry, inbound, None).await.unwrap();

        let inbound = tokio_stream::iter(vec![
            Ok(AppendToFileRequest {
                filesystem: Some(proto::FileSystem {
                    id: fx.id.clone(),
                    request: None,
                }),
                path: Some(proto::Path {
                    path: "/log".to_string(),
                    separator: String::new(),
                }),
                buffer: b"two\n".to_vec(),
            }),
            Ok(AppendToFileRequest {
                buffer: b"three\n".to_vec(),
                ..Default::default()
            }),
        ]);
        receive_file(&fx.registry, inbound, None).await.unwrap();

        let content: Vec<u8> = read_all(&fx, "/log", 8192)
            .await
            .into_iter()
            .flat_map(|c| c.unwrap())
            .collect();
        assert_eq!(content, b"one\ntwo\nthree\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_upload_is_invalid_argument() {
        let fx = fixture();
        let inbound = tokio_stream::iter(Vec::<Result<WriteToFileRequest, Status>>::new());
        let status = receive_file(&fx.registry, inbound, None).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let inbound = tokio_stream::iter(vec![chunk(b"no target")]);
        let status = receive_file(&fx.registry, inbound, None).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_aborted_upload_closes_file_without_ack() {
        let fx = fixture();
        let inbound = tokio_stream::iter(vec![
            write(&fx.id, "/partial", b"some"),
            Err(Status::cancelled("client went away")),
        ]);
        let status = receive_file(&fx.registry, inbound, None).await.unwrap_err();
        assert_eq!(status.code(), Code::Cancelled);
        assert!(fx.fs.exists(&RemotePath::new("/partial")).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upload_past_deadline() {
        let fx = fixture();
        let inbound = tokio_stream::iter(vec![write(&fx.id, "/slow", b"x")])
            .chain(tokio_stream::pending());
        let deadline = Instant::now() + Duration::from_millis(50);
        let status = receive_file(&fx.registry, Box::pin(inbound), Some(deadline))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    /// Source that yields its data and then fails instead of reporting end
    /// of stream.
    struct FailingSource {
        data: io::Cursor<Vec<u8>>,
        closed: Arc<AtomicBool>,
    }

    impl io::Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(io::Error::other("device went away")),
                n => Ok(n),
            }
        }
    }

    impl ByteSource for FailingSource {
        fn close(self: Box<Self>) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn pump(
        data: &[u8],
        chunk_size: usize,
        deadline: Option<Instant>,
    ) -> (Vec<Result<Vec<u8>, Status>>, bool) {
        let closed = Arc::new(AtomicBool::new(false));
        let source = Box::new(FailingSource {
            data: io::Cursor::new(data.to_vec()),
            closed: Arc::clone(&closed),
        });
        let (tx, rx) = mpsc::channel(CHUNK_BACKLOG);
        tokio::task::spawn_blocking(move || {
            pump_source(source, &RemotePath::new("/flaky"), chunk_size, deadline, &tx);
        });
        let items = ReceiverStream::new(rx)
            .map(|r| r.map(|m| m.buffer))
            .collect()
            .await;
        (items, closed.load(Ordering::SeqCst))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_failure_after_chunks_ends_stream_with_error() {
        let (items, closed) = pump(b"abcdefgh", 4, None).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), b"abcd");
        assert_eq!(items[1].as_ref().unwrap(), b"efgh");
        let status = items[2].as_ref().unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("device went away"), "{}", status.message());
        assert!(closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_past_deadline_closes_source() {
        let (items, closed) = pump(b"abcdefgh", 4, Some(Instant::now())).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap_err().code(), Code::DeadlineExceeded);
        assert!(closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_missing_file_is_not_found() {
        let fx = fixture();
        let status = send_file(Arc::clone(&fx.fs), RemotePath::new("/nope"), 8192, None)
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("/nope"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_handle_is_not_found() {
        let fx = fixture();
        let inbound = tokio_stream::iter(vec![write("file://nobody@x#9", "/f", b"x")]);
        let status = receive_file(&fx.registry, inbound, None).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("file://nobody@x#9"));
    }
}
