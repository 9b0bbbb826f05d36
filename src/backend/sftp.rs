//! Backend over an SFTP session.
//!
//! libssh2 is a blocking library, so every remote operation runs under
//! [`tokio::task::spawn_blocking`] while holding the session mutex. Each
//! read or write opens its own remote handle, positions it, transfers and
//! closes; nothing remote outlives a single call.

use std::env;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use ssh2::{ErrorCode, OpenFlags, OpenType, Session, Sftp};
use tokio::task;
use tracing::debug;

use super::{vpath, AttrValue, BackendFS, Error, FileMeta, Result};
use super::{ATTR_MODE, ATTR_MODTIME, ATTR_SIZE};

/// SFTP status values from the protocol (draft-ietf-secsh-filexfer).
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_PERMISSION_DENIED: i32 = 3;
const SSH_FX_FAILURE: i32 = 4;

struct Conn {
    session: Session,
    sftp: Sftp,
}

/// Backend exporting a directory of a remote SFTP server.
pub struct SftpBackend {
    label: String,
    server_path: String,
    conn: Arc<Mutex<Option<Conn>>>,
}

impl SftpBackend {
    /// Connect to `host:port` and export `server_path`.
    ///
    /// Authentication tries the SSH agent first when `SSH_AUTH_SOCK` is
    /// present, then falls back to the password when one was supplied.
    pub fn connect(
        user: &str,
        pass: &str,
        host: &str,
        port: u16,
        server_path: &str,
    ) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).map_err(Error::io)?;
        let mut session = Session::new().map_err(Error::io)?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(Error::io)?;

        if env::var_os("SSH_AUTH_SOCK").is_some() {
            if let Err(err) = session.userauth_agent(user) {
                debug!(%err, "agent authentication failed");
            }
        }
        if !session.authenticated() && !pass.is_empty() {
            session.userauth_password(user, pass).map_err(Error::io)?;
        }
        if !session.authenticated() {
            return Err(Error::io("no authentication method succeeded"));
        }

        let sftp = session.sftp().map_err(Error::io)?;
        Ok(Self {
            label: format!("sftp({user}@{host}:{port}{server_path})"),
            server_path: server_path.to_owned(),
            conn: Arc::new(Mutex::new(Some(Conn { session, sftp }))),
        })
    }

    fn translate(&self, path: &str) -> PathBuf {
        let canonical = vpath::canonical(path);
        let mut real = self.server_path.trim_end_matches('/').to_owned();
        real.push_str(&canonical);
        PathBuf::from(real)
    }

    /// Run `op` on the blocking pool with the SFTP session locked.
    async fn with_sftp<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| Error::io("session lock poisoned"))?;
            let conn = guard.as_ref().ok_or(Error::Invalid)?;
            op(&conn.sftp)
        })
        .await
        .map_err(|err| Error::io(err))?
    }

    fn meta_from(path: &Path, stat: &ssh2::FileStat) -> FileMeta {
        let is_directory = stat.is_dir();
        FileMeta {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_owned()),
            size: if is_directory { 0 } else { stat.size.unwrap_or(0) },
            mode: stat.perm.unwrap_or(0) & 0o7777,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(stat.mtime.unwrap_or(0)),
            is_directory,
        }
    }
}

/// Translate an SFTP status into the backend taxonomy. `on_failure`
/// substitutes for the catch-all `SSH_FX_FAILURE`, whose meaning depends
/// on the operation that produced it.
fn map_sftp_error(err: ssh2::Error, on_failure: Error) -> Error {
    match err.code() {
        ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE) => Error::NotExist,
        ErrorCode::SFTP(SSH_FX_PERMISSION_DENIED) => Error::Permission,
        ErrorCode::SFTP(SSH_FX_FAILURE) => on_failure,
        _ => Error::io(err),
    }
}

fn map_err_io(err: ssh2::Error) -> Error {
    map_sftp_error(err, Error::io("remote operation failed"))
}

#[async_trait::async_trait]
impl BackendFS for SftpBackend {
    async fn create_file(&self, path: &str) -> Result<()> {
        let real = self.translate(path);
        self.with_sftp(move |sftp| {
            if sftp.stat(&real).is_ok() {
                return Err(Error::Exist);
            }
            let file = sftp
                .open_mode(
                    &real,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
                    0o644,
                    OpenType::File,
                )
                .map_err(|err| map_sftp_error(err, Error::Exist))?;
            drop(file);
            Ok(())
        })
        .await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let real = self.translate(path);
        self.with_sftp(move |sftp| {
            if sftp.stat(&real).is_ok() {
                return Err(Error::Exist);
            }
            sftp.mkdir(&real, 0o777).map_err(|err| map_sftp_error(err, Error::Exist))
        })
        .await
    }

    async fn write_file(&self, path: &str, data: &[u8], offset: u64) -> Result<usize> {
        let real = self.translate(path);
        let data = data.to_vec();
        self.with_sftp(move |sftp| {
            let mut file = sftp
                .open_mode(&real, OpenFlags::WRITE, 0o644, OpenType::File)
                .map_err(map_err_io)?;
            file.seek(SeekFrom::Start(offset)).map_err(Error::io)?;
            file.write_all(&data).map_err(Error::io)?;
            Ok(data.len())
        })
        .await
    }

    async fn read_file(&self, path: &str, dest: &mut [u8], offset: u64) -> Result<usize> {
        let real = self.translate(path);
        let wanted = dest.len();
        let bytes = self
            .with_sftp(move |sftp| {
                let mut file = sftp.open(&real).map_err(map_err_io)?;
                file.seek(SeekFrom::Start(offset)).map_err(Error::io)?;
                let mut out = vec![0u8; wanted];
                let mut filled = 0;
                while filled < wanted {
                    let n = file.read(&mut out[filled..]).map_err(Error::io)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                out.truncate(filled);
                Ok(out)
            })
            .await?;
        dest[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    async fn read_directory(&self, path: &str) -> Result<Vec<FileMeta>> {
        let real = self.translate(path);
        self.with_sftp(move |sftp| {
            let listing = sftp.readdir(&real).map_err(map_err_io)?;
            Ok(listing
                .iter()
                .map(|(child, stat)| SftpBackend::meta_from(child, stat))
                .collect())
        })
        .await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old_real = self.translate(old_path);
        let new_real = self.translate(new_path);
        self.with_sftp(move |sftp| {
            sftp.rename(&old_real, &new_real, None).map_err(map_err_io)
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let real = self.translate(path);
        self.with_sftp(move |sftp| {
            let stat = sftp.stat(&real).map_err(map_err_io)?;
            if stat.is_dir() {
                sftp.rmdir(&real).map_err(|err| map_sftp_error(err, Error::NotEmpty))
            } else {
                sftp.unlink(&real).map_err(map_err_io)
            }
        })
        .await
    }

    async fn stat(&self, path: &str) -> Result<FileMeta> {
        let real = self.translate(path);
        self.with_sftp(move |sftp| {
            let stat = sftp.stat(&real).map_err(map_err_io)?;
            Ok(SftpBackend::meta_from(&real, &stat))
        })
        .await
    }

    async fn get_attribute(&self, path: &str, attr: &str) -> Result<AttrValue> {
        let meta = self.stat(path).await?;
        match attr {
            ATTR_MODTIME => Ok(AttrValue::ModTime(meta.modified)),
            ATTR_MODE => Ok(AttrValue::Mode(meta.mode)),
            ATTR_SIZE => Ok(AttrValue::Size(meta.size)),
            _ => Err(Error::Invalid),
        }
    }

    async fn set_attribute(&self, path: &str, attr: &str, value: AttrValue) -> Result<()> {
        super::check_attr_kind(attr, &value)?;
        let real = self.translate(path);
        self.with_sftp(move |sftp| {
            let mut stat = ssh2::FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: None,
                atime: None,
                mtime: None,
            };
            match value {
                AttrValue::ModTime(time) => {
                    let secs = time
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    let now = SystemTime::now()
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    stat.mtime = Some(secs);
                    stat.atime = Some(now);
                }
                AttrValue::Mode(mode) => stat.perm = Some(mode),
                AttrValue::Size(size) => stat.size = Some(size),
            }
            sftp.setstat(&real, stat).map_err(map_err_io)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| Error::io("session lock poisoned"))?;
            let conn = guard.take().ok_or(Error::Invalid)?;
            // Channel first, then transport.
            drop(conn.sftp);
            let _ = conn.session.disconnect(None, "shutdown", None);
            Ok(())
        })
        .await
        .map_err(|err| Error::io(err))?
    }

    fn display_name(&self) -> String {
        let closed = self.conn.lock().map(|guard| guard.is_none()).unwrap_or(true);
        if closed {
            format!("{}(closed)", self.label)
        } else {
            self.label.clone()
        }
    }
}
