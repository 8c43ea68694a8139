//! Blocking SSH transport backed by libssh2.
//!
//! Every method here blocks; callers run them through `spawn_blocking`.

use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use secrecy::ExposeSecret;
use ssh2::{CheckResult, KnownHostFileKind, Session};

use crate::config::HostKeyPolicy;
use crate::ssh::session::{CommandOutput, Connector, SessionParams, SessionTransport, TransportError};

/// Opens libssh2 sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Connector;

impl Connector for Ssh2Connector {
    fn connect(&self, params: &SessionParams) -> Result<Box<dyn SessionTransport>, String> {
        let addr = (params.host.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|e| format!("cannot resolve {}: {e}", params.host))?
            .next()
            .ok_or_else(|| format!("no address for {}", params.host))?;

        let tcp = TcpStream::connect_timeout(&addr, params.connect_timeout)
            .map_err(|e| format!("tcp connect: {e}"))?;

        let mut session = Session::new().map_err(|e| e.to_string())?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(params.connect_timeout));
        session.handshake().map_err(|e| format!("handshake: {e}"))?;

        verify_host_key(&session, params)?;
        authenticate(&session, params)?;

        Ok(Box::new(Ssh2Transport {
            session,
            closed: false,
        }))
    }
}

fn verify_host_key(session: &Session, params: &SessionParams) -> Result<(), String> {
    match params.host_key_policy {
        HostKeyPolicy::AcceptAny => Ok(()),
        HostKeyPolicy::Strict => {
            let mut known = session.known_hosts().map_err(|e| e.to_string())?;
            known
                .read_file(&params.known_hosts, KnownHostFileKind::OpenSSH)
                .map_err(|e| format!("reading {}: {e}", params.known_hosts.display()))?;
            let (key, _) = session
                .host_key()
                .ok_or_else(|| "server presented no host key".to_string())?;
            match known.check_port(&params.host, params.port, key) {
                CheckResult::Match => Ok(()),
                CheckResult::NotFound => Err(format!("host {} not in known_hosts", params.host)),
                CheckResult::Mismatch => Err(format!("host key mismatch for {}", params.host)),
                CheckResult::Failure => Err("known_hosts check failed".to_string()),
            }
        }
    }
}

fn authenticate(session: &Session, params: &SessionParams) -> Result<(), String> {
    let key = params.key_path.as_deref().filter(|p| p.exists());

    let attempt = if let Some(key) = key {
        session.userauth_pubkey_file(&params.user, None, key, None)
    } else if let Some(password) = &params.password {
        session.userauth_password(&params.user, password.expose_secret())
    } else {
        session.userauth_agent(&params.user)
    };

    attempt.map_err(|e| format!("authentication as {}: {e}", params.user))?;

    if session.authenticated() {
        Ok(())
    } else {
        Err(format!("authentication as {} rejected", params.user))
    }
}

/// Pause between polls when neither stream has data.
const DRAIN_POLL: Duration = Duration::from_millis(10);

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

/// Read both streams until the remote end signals EOF or `deadline` passes.
///
/// The underlying session must be non-blocking so a stalled stream yields
/// `WouldBlock` instead of parking the thread.
fn drain<O, E>(
    mut stdout: O,
    mut stderr: E,
    eof: impl Fn() -> bool,
    deadline: Instant,
) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    O: Read,
    E: Read,
{
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        // Sample EOF first so data that lands during the reads is not lost.
        let finished = eof();
        let read = read_available(&mut stdout, &mut buf, &mut out)?
            + read_available(&mut stderr, &mut buf, &mut err)?;
        if read > 0 {
            continue;
        }
        if finished {
            return Ok((out, err));
        }
        if Instant::now() >= deadline {
            return Err(std::io::Error::new(ErrorKind::TimedOut, "command timed out"));
        }
        std::thread::sleep(DRAIN_POLL);
    }
}

fn read_available(stream: &mut impl Read, buf: &mut [u8], into: &mut Vec<u8>) -> std::io::Result<usize> {
    match stream.read(buf) {
        Ok(n) => {
            into.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

/// Live libssh2 session.
pub struct Ssh2Transport {
    session: Session,
    closed: bool,
}

impl Ssh2Transport {
    fn sftp(&self) -> std::io::Result<ssh2::Sftp> {
        Ok(self.session.sftp()?)
    }
}

impl SessionTransport for Ssh2Transport {
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, TransportError> {
        self.session.set_timeout(millis(timeout));
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| TransportError::Failed(e.to_string()))?;

        let session = &self.session;
        let run = (|| -> std::io::Result<CommandOutput> {
            channel.exec(command)?;

            // stdout and stderr share one window; read them together.
            session.set_blocking(false);
            let drained = drain(
                channel.stream(0),
                channel.stderr(),
                || channel.eof(),
                Instant::now() + timeout,
            );
            session.set_blocking(true);
            let (stdout, stderr) = drained?;

            channel.wait_close()?;
            let exit_status = channel.exit_status()?;
            Ok(CommandOutput {
                stdout,
                stderr,
                exit_status,
            })
        })();

        match run {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Closing the channel hangs up the remote process.
                let _ = channel.close();
                Err(TransportError::Timeout)
            }
            Err(e) => {
                let _ = channel.close();
                Err(TransportError::Failed(e.to_string()))
            }
        }
    }

    fn download(&mut self, remote: &Path, local: &Path) -> Result<(), TransportError> {
        let run = || -> std::io::Result<()> {
            let sftp = self.sftp()?;
            let mut source = sftp.open(remote)?;
            let mut target = std::fs::File::create(local)?;
            std::io::copy(&mut source, &mut target)?;
            Ok(())
        };
        run().map_err(|e| TransportError::Failed(e.to_string()))
    }

    fn upload(&mut self, local: &Path, remote: &Path) -> Result<(), TransportError> {
        let run = || -> std::io::Result<()> {
            let sftp = self.sftp()?;
            let mut source = std::fs::File::open(local)?;
            let mut target = sftp.create(remote)?;
            std::io::copy(&mut source, &mut target)?;
            Ok(())
        };
        run().map_err(|e| TransportError::Failed(e.to_string()))
    }

    fn is_active(&self) -> bool {
        !self.closed && self.session.authenticated()
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.session.disconnect(None, "closing", None);
            self.closed = true;
        }
    }
}
