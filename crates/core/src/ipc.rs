/// Inter-Process Communication between secondary and primary instances
/// Uses Windows Named Pipes (Unix domain sockets elsewhere) for forwarding
/// launch arguments
use crate::config::GuardConfig;
use crate::error::{InstanceError, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Largest payload accepted on the activation endpoint
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Launch arguments forwarded from a secondary to the primary
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActivationMessage {
    pub args: Vec<String>,
}

impl ActivationMessage {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Write one frame: 4-byte little-endian length, then the bincode payload
pub fn write_message<W: Write>(writer: &mut W, message: &ActivationMessage) -> Result<()> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(InstanceError::Protocol(format!(
            "message of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_MESSAGE_LEN
        )));
    }

    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame written by [`write_message`]
pub fn read_message<R: Read>(reader: &mut R) -> Result<ActivationMessage> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(InstanceError::Protocol(format!(
            "frame length {} exceeds the {} byte limit",
            len, MAX_MESSAGE_LEN
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    Ok(bincode::deserialize(&payload)?)
}

/// Send `args` to the primary as a single activation message.
///
/// Fails with [`InstanceError::Connect`] when the primary's endpoint cannot be
/// reached or the write is cut short. No retry is attempted.
pub fn forward_arguments<I, S>(config: &GuardConfig, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let message = ActivationMessage::new(args);
    let endpoint = config.endpoint_path().display().to_string();

    let connect_error = |source| InstanceError::Connect {
        endpoint: endpoint.clone(),
        source,
    };

    let mut client = PipeClient::connect(config).map_err(connect_error)?;

    match write_message(&mut client, &message) {
        Ok(()) => {}
        Err(InstanceError::Io(e)) => return Err(connect_error(e)),
        Err(e) => return Err(e),
    }

    tracing::debug!(
        "Forwarded {} argument(s) to primary at {}",
        message.args.len(),
        endpoint
    );
    Ok(())
}

pub use imp::{interrupt_blocking_io, ConnectionAbort, PipeClient, PipeConnection, PipeServer};

/// Named Pipe transport
#[cfg(windows)]
mod imp {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::windows::io::AsRawHandle;
    use std::ptr::null_mut;
    use std::thread::JoinHandle;
    use windows::core::HSTRING;
    use windows::Win32::System::IO::CancelSynchronousIo;
    use windows::Win32::{Foundation::*, Storage::FileSystem::*, System::Pipes::*};

    /// Pipe server held by the primary
    /// One instance, reused for every connection
    pub struct PipeServer {
        pipe_handle: HANDLE,
    }

    impl PipeServer {
        pub fn bind(config: &GuardConfig) -> io::Result<Self> {
            let pipe_name = HSTRING::from(config.endpoint_path().as_os_str());

            unsafe {
                let pipe_handle = CreateNamedPipeW(
                    &pipe_name,
                    PIPE_ACCESS_INBOUND | FILE_FLAG_FIRST_PIPE_INSTANCE,
                    PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                    1,                // Max instances
                    8192,             // Out buffer size
                    8192,             // In buffer size
                    0,                // Default timeout
                    Some(null_mut()), // Default security
                );

                if pipe_handle.is_invalid() {
                    return Err(io::Error::last_os_error());
                }

                Ok(Self { pipe_handle })
            }
        }

        /// Wait for a secondary to connect (blocking)
        pub fn accept(&mut self) -> io::Result<PipeConnection<'_>> {
            unsafe {
                match ConnectNamedPipe(self.pipe_handle, None) {
                    Ok(_) => {}
                    // The client connected between creation and this call
                    Err(e) if e.code() == ERROR_PIPE_CONNECTED.to_hresult() => {}
                    Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
                }
            }
            Ok(PipeConnection { server: self })
        }
    }

    impl Drop for PipeServer {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.pipe_handle);
            }
            tracing::debug!("Named pipe server closed");
        }
    }

    /// An accepted connection; disconnects the pipe instance on drop so it
    /// can accept the next secondary
    pub struct PipeConnection<'a> {
        server: &'a mut PipeServer,
    }

    impl Read for PipeConnection<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut bytes_read = 0u32;
            unsafe {
                match ReadFile(
                    self.server.pipe_handle,
                    Some(buf),
                    Some(&mut bytes_read),
                    None,
                ) {
                    Ok(_) => Ok(bytes_read as usize),
                    // Client closed its end; report end of stream
                    Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(0),
                    Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
                }
            }
        }
    }

    impl PipeConnection<'_> {
        /// Blocking pipe reads are cancelled per thread instead, see
        /// [`interrupt_blocking_io`]
        pub fn abort_handle(&self) -> Option<ConnectionAbort> {
            None
        }
    }

    impl Drop for PipeConnection<'_> {
        fn drop(&mut self) {
            unsafe {
                let _ = DisconnectNamedPipe(self.server.pipe_handle);
            }
        }
    }

    pub enum ConnectionAbort {}

    impl ConnectionAbort {
        pub fn abort(&self) {
            match *self {}
        }
    }

    /// Cancel the pending ConnectNamedPipe/ReadFile of the listener thread
    pub fn interrupt_blocking_io(thread: &JoinHandle<()>) {
        unsafe {
            let _ = CancelSynchronousIo(HANDLE(thread.as_raw_handle() as isize));
        }
    }

    /// Pipe client used by secondaries
    pub struct PipeClient {
        file: File,
    }

    impl PipeClient {
        pub fn connect(config: &GuardConfig) -> io::Result<Self> {
            let path = config.endpoint_path();

            loop {
                match OpenOptions::new().write(true).open(&path) {
                    Ok(file) => return Ok(Self { file }),
                    Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY.0 as i32) => {
                        // Another secondary is being served; 0 waits for the
                        // pipe's default timeout
                        let name = HSTRING::from(path.as_os_str());
                        let ready = unsafe { WaitNamedPipeW(&name, 0) };
                        if !ready.as_bool() {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    impl Write for PipeClient {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.file.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }
}

/// Unix domain socket transport
#[cfg(not(windows))]
mod imp {
    use super::*;
    use std::fs;
    use std::net::Shutdown;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::PathBuf;
    use std::thread::JoinHandle;

    /// Socket server held by the primary
    pub struct PipeServer {
        listener: UnixListener,
        path: PathBuf,
    }

    impl PipeServer {
        pub fn bind(config: &GuardConfig) -> io::Result<Self> {
            let path = config.endpoint_path();
            fs::create_dir_all(&config.runtime_dir)?;

            // Only the lock holder binds, so a leftover socket belongs to a
            // primary that died without cleaning up
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }

            let listener = UnixListener::bind(&path)?;
            Ok(Self { listener, path })
        }

        /// Wait for a secondary to connect (blocking)
        pub fn accept(&mut self) -> io::Result<PipeConnection> {
            let (stream, _) = self.listener.accept()?;
            Ok(PipeConnection { stream })
        }
    }

    /// An accepted secondary
    pub struct PipeConnection {
        stream: UnixStream,
    }

    impl PipeConnection {
        /// Handle that can end a read blocked on this connection from
        /// another thread
        pub fn abort_handle(&self) -> Option<ConnectionAbort> {
            self.stream.try_clone().ok().map(ConnectionAbort)
        }
    }

    impl Read for PipeConnection {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.stream.read(buf)
        }
    }

    pub struct ConnectionAbort(UnixStream);

    impl ConnectionAbort {
        /// Shut the socket down; a pending read returns end of stream
        pub fn abort(&self) {
            let _ = self.0.shutdown(Shutdown::Both);
        }
    }

    /// Reads are aborted per connection on Unix, see [`ConnectionAbort`]
    pub fn interrupt_blocking_io(_thread: &JoinHandle<()>) {}

    impl Drop for PipeServer {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
            tracing::debug!("Activation socket {} closed", self.path.display());
        }
    }

    /// Socket client used by secondaries
    pub struct PipeClient {
        stream: UnixStream,
    }

    impl PipeClient {
        pub fn connect(config: &GuardConfig) -> io::Result<Self> {
            let stream = UnixStream::connect(config.endpoint_path())?;
            Ok(Self { stream })
        }
    }

    impl Write for PipeClient {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.stream.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.stream.flush()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_frame_layout() {
        let message = ActivationMessage::new(["--file", "a.txt"]);
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).unwrap();

        let payload_len = u32::from_le_bytes(buffer[..4].try_into().unwrap()) as usize;
        assert_eq!(payload_len, buffer.len() - 4);
        assert_eq!(read_message(&mut Cursor::new(buffer)).unwrap(), message);
    }

    #[test]
    fn test_empty_and_unicode_arguments_survive() {
        let message = ActivationMessage::new(["", "héllo wörld", "--flag=a b"]);
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).unwrap();

        let decoded = read_message(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(decoded.args, vec!["", "héllo wörld", "--flag=a b"]);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut buffer = ((MAX_MESSAGE_LEN + 1) as u32).to_le_bytes().to_vec();
        buffer.extend_from_slice(&[0u8; 16]);

        let err = read_message(&mut Cursor::new(buffer)).unwrap_err();
        assert!(matches!(err, InstanceError::Protocol(_)));
    }

    #[test]
    fn test_oversized_message_is_not_sent() {
        let message = ActivationMessage::new(["x".repeat(MAX_MESSAGE_LEN)]);
        let mut buffer = Vec::new();

        let err = write_message(&mut buffer, &message).unwrap_err();
        assert!(matches!(err, InstanceError::Protocol(_)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_garbage_payload_is_protocol_error() {
        // Claims u64::MAX arguments
        let mut buffer = 8u32.to_le_bytes().to_vec();
        buffer.extend_from_slice(&[0xff; 8]);

        let err = read_message(&mut Cursor::new(buffer)).unwrap_err();
        assert!(matches!(err, InstanceError::Protocol(_)));
    }

    #[test]
    fn test_truncated_frame_is_io_error() {
        let err = read_message(&mut Cursor::new(vec![4u8, 0])).unwrap_err();
        assert!(matches!(err, InstanceError::Io(_)));
    }

    #[test]
    fn test_forward_without_primary_is_connect_error() {
        let dir = TempDir::new().unwrap();
        let config = GuardConfig::for_app(format!("IpcNoPrimary{}", std::process::id()))
            .with_runtime_dir(dir.path());

        let err = forward_arguments(&config, ["--file", "b.txt"]).unwrap_err();
        assert!(matches!(err, InstanceError::Connect { .. }));
    }

    #[test]
    fn test_forward_reaches_server() {
        let dir = TempDir::new().unwrap();
        let config = GuardConfig::for_app(format!("IpcRoundTrip{}", std::process::id()))
            .with_runtime_dir(dir.path());

        let mut server = PipeServer::bind(&config).unwrap();
        let reader = std::thread::spawn(move || {
            let mut connection = server.accept().unwrap();
            read_message(&mut connection).unwrap()
        });

        forward_arguments(&config, ["--file", "b.txt"]).unwrap();
        assert_eq!(reader.join().unwrap().args, vec!["--file", "b.txt"]);
    }
}
