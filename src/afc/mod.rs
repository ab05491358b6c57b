//! AFC (Apple File Conduit) client for the device's sandboxed file systems.
//!
//! Speaks the framed request/response protocol directly over whatever
//! [`ReadWrite`] socket the tunnel handed back — a DTX channel, a TLS-PSK
//! stream, anything. The opcode-level calls mirror the wire protocol
//! one-to-one; the porcelain methods at the bottom of this module build the
//! higher-level operations (`stat`, recursive `rm`, `push`, `walk`, ...) out
//! of them.

use std::collections::{HashMap, VecDeque};

pub use errors::AfcError;
use file::FileDescriptor;
use opcode::{AfcFopenMode, AfcOpcode};
use packet::{AfcPacket, AfcPacketHeader};
use tracing::warn;

use crate::{Error, ReadWrite};

pub mod errors;
pub mod file;
pub mod opcode;
pub mod packet;

/// Magic value ("CFA6LPAA" read little-endian) at the start of every AFC packet.
pub const MAGIC: u64 = 0x4141504c36414643;

/// An open AFC session. One session per connected service socket; opcodes
/// are correlated to responses purely by FIFO ordering, so callers must not
/// issue a second request before the first has been read.
pub struct AfcSession<R: ReadWrite> {
    socket: R,
    packet_num: u64,
}

/// Information about a file or directory on the device.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// Size of the file in bytes.
    pub size: usize,
    /// Number of blocks allocated for the file.
    pub blocks: usize,
    /// Creation timestamp.
    pub creation: chrono::NaiveDateTime,
    /// Last modification timestamp.
    pub modified: chrono::NaiveDateTime,
    /// Number of hard links.
    pub st_nlink: String,
    /// File type string, e.g. `"S_IFREG"`, `"S_IFDIR"`, `"S_IFLNK"`.
    pub st_ifmt: String,
    /// Target path if this entry is a symbolic link.
    pub st_link_target: Option<String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.st_ifmt == "S_IFDIR"
    }

    pub fn is_symlink(&self) -> bool {
        self.st_ifmt == "S_IFLNK"
    }
}

/// Information about the device's AFC-visible filesystem.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub model: String,
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub block_size: usize,
}

fn parse_kv_payload(payload: &[u8]) -> HashMap<String, String> {
    let strings: Vec<String> = payload
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    strings
        .chunks_exact(2)
        .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
        .collect()
}

/// Joins a non-absolute symlink target to the parent directory of `path`.
fn join_relative_to_parent(path: &str, target: &str) -> String {
    let parent = match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent,
        Some(_) => "/",
        None => "",
    };
    if parent.is_empty() {
        target.to_string()
    } else if parent == "/" {
        format!("/{target}")
    } else {
        format!("{parent}/{target}")
    }
}

impl<R: ReadWrite> AfcSession<R> {
    /// Wraps an already-connected socket in an AFC session.
    pub fn new(socket: R) -> Self {
        Self {
            socket,
            packet_num: 0,
        }
    }

    async fn simple_request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
    ) -> Result<AfcPacket, Error> {
        let header_len = header_payload.len() as u64 + AfcPacketHeader::LEN;
        let header = AfcPacketHeader {
            magic: MAGIC,
            entire_len: header_len,
            header_payload_len: header_len,
            packet_num: self.packet_num,
            operation,
        };
        self.packet_num += 1;

        let packet = AfcPacket {
            header,
            header_payload,
            payload: Vec::new(),
        };

        self.send(packet).await?;
        self.read().await
    }

    /// Lists the direct children of a directory, including `.` and `..`.
    pub async fn list_dir(&mut self, path: impl Into<String>) -> Result<Vec<String>, Error> {
        let path = path.into();
        let res = self
            .simple_request(AfcOpcode::ReadDir, path.into_bytes())
            .await?;

        Ok(res
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    /// Creates a directory. Does not create missing parents.
    pub async fn mk_dir(&mut self, path: impl Into<String>) -> Result<(), Error> {
        self.simple_request(AfcOpcode::MakeDir, path.into().into_bytes())
            .await?;
        Ok(())
    }

    /// Retrieves information about a file, directory, or symlink.
    pub async fn get_file_info(&mut self, path: impl Into<String>) -> Result<FileInfo, Error> {
        let res = self
            .simple_request(AfcOpcode::GetFileInfo, path.into().into_bytes())
            .await?;

        let mut kvs = parse_kv_payload(&res.payload);

        let size = kvs
            .remove("st_size")
            .and_then(|x| x.parse::<usize>().ok())
            .ok_or(Error::AfcMissingAttribute("st_size"))?;
        let blocks = kvs
            .remove("st_blocks")
            .and_then(|x| x.parse::<usize>().ok())
            .ok_or(Error::AfcMissingAttribute("st_blocks"))?;

        let creation = kvs
            .remove("st_birthtime")
            .and_then(|x| x.parse::<i64>().ok())
            .ok_or(Error::AfcMissingAttribute("st_birthtime"))?;
        let creation = chrono::DateTime::from_timestamp_nanos(creation).naive_local();

        let modified = kvs
            .remove("st_mtime")
            .and_then(|x| x.parse::<i64>().ok())
            .ok_or(Error::AfcMissingAttribute("st_mtime"))?;
        let modified = chrono::DateTime::from_timestamp_nanos(modified).naive_local();

        let st_nlink = kvs
            .remove("st_nlink")
            .ok_or(Error::AfcMissingAttribute("st_nlink"))?;
        let st_ifmt = kvs
            .remove("st_ifmt")
            .ok_or(Error::AfcMissingAttribute("st_ifmt"))?;
        let st_link_target = kvs.remove("LinkTarget");

        if !kvs.is_empty() {
            warn!("file info response had unexpected leftover keys: {kvs:?}");
        }

        Ok(FileInfo {
            size,
            blocks,
            creation,
            modified,
            st_nlink,
            st_ifmt,
            st_link_target,
        })
    }

    /// Retrieves filesystem-level information about the device.
    pub async fn get_device_info(&mut self) -> Result<DeviceInfo, Error> {
        let res = self.simple_request(AfcOpcode::GetDevInfo, Vec::new()).await?;
        let mut kvs = parse_kv_payload(&res.payload);

        let model = kvs
            .remove("Model")
            .ok_or(Error::AfcMissingAttribute("Model"))?;
        let total_bytes = kvs
            .remove("FSTotalBytes")
            .and_then(|x| x.parse::<usize>().ok())
            .ok_or(Error::AfcMissingAttribute("FSTotalBytes"))?;
        let free_bytes = kvs
            .remove("FSFreeBytes")
            .and_then(|x| x.parse::<usize>().ok())
            .ok_or(Error::AfcMissingAttribute("FSFreeBytes"))?;
        let block_size = kvs
            .remove("FSBlockSize")
            .and_then(|x| x.parse::<usize>().ok())
            .ok_or(Error::AfcMissingAttribute("FSBlockSize"))?;

        if !kvs.is_empty() {
            warn!("device info response had unexpected leftover keys: {kvs:?}");
        }

        Ok(DeviceInfo {
            model,
            total_bytes,
            free_bytes,
            block_size,
        })
    }

    /// Removes a single file or empty directory.
    pub async fn remove(&mut self, path: impl Into<String>) -> Result<(), Error> {
        self.simple_request(AfcOpcode::RemovePath, path.into().into_bytes())
            .await?;
        Ok(())
    }

    /// Recursively removes a directory and all of its contents in one request.
    pub async fn remove_all(&mut self, path: impl Into<String>) -> Result<(), Error> {
        self.simple_request(AfcOpcode::RemovePathAndContents, path.into().into_bytes())
            .await?;
        Ok(())
    }

    /// Opens a file, returning a handle for subsequent seek/read/write/close calls.
    pub async fn open<'f>(
        &'f mut self,
        path: impl Into<String>,
        mode: AfcFopenMode,
    ) -> Result<FileDescriptor<'f, R>, Error> {
        let path = path.into();
        let mut header_payload = (mode as u64).to_le_bytes().to_vec();
        header_payload.extend(path.as_bytes());

        let res = self.simple_request(AfcOpcode::FileOpen, header_payload).await?;
        if res.header_payload.len() < 8 {
            warn!("file-open response header payload is shorter than 8 bytes");
            return Err(Error::UnexpectedResponse);
        }
        let fd = u64::from_le_bytes(res.header_payload[..8].try_into().unwrap());
        Ok(FileDescriptor {
            client: self,
            fd,
            path,
        })
    }

    /// Creates a hard or symbolic link.
    pub async fn link(
        &mut self,
        target: impl Into<String>,
        source: impl Into<String>,
        kind: opcode::LinkType,
    ) -> Result<(), Error> {
        let target = target.into();
        let source = source.into();

        let mut header_payload = (kind as u64).to_le_bytes().to_vec();
        header_payload.extend(target.as_bytes());
        header_payload.push(0);
        header_payload.extend(source.as_bytes());
        header_payload.push(0);

        self.simple_request(AfcOpcode::MakeLink, header_payload).await?;
        Ok(())
    }

    /// Renames (or moves) a file or directory.
    pub async fn rename(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<(), Error> {
        let target = target.into();
        let source = source.into();

        let mut header_payload = source.as_bytes().to_vec();
        header_payload.push(0);
        header_payload.extend(target.as_bytes());
        header_payload.push(0);

        self.simple_request(AfcOpcode::RenamePath, header_payload)
            .await?;
        Ok(())
    }

    /// Reads a response packet, translating a `Status` opcode carrying a
    /// non-success code into [`Error::Afc`].
    pub async fn read(&mut self) -> Result<AfcPacket, Error> {
        let res = AfcPacket::read(&mut self.socket).await?;
        if res.header.operation == AfcOpcode::Status {
            if res.header_payload.len() < 8 {
                return Err(Error::UnexpectedResponse);
            }
            let code = u64::from_le_bytes(res.header_payload[..8].try_into().unwrap());
            let e = AfcError::from(code);
            if e == AfcError::Success {
                return Ok(res);
            }
            return Err(Error::Afc(e));
        }
        Ok(res)
    }

    /// Sends a fully constructed packet.
    pub async fn send(&mut self, packet: AfcPacket) -> Result<(), Error> {
        packet.write(&mut self.socket).await
    }

    // ---- porcelain ----

    /// `stat`-like lookup; returns `None` if the path does not exist, instead
    /// of an error, so callers can use it for existence checks too.
    pub async fn stat(&mut self, path: impl Into<String>) -> Result<Option<FileInfo>, Error> {
        match self.get_file_info(path).await {
            Ok(info) => Ok(Some(info)),
            Err(Error::Afc(AfcError::ObjectNotFound)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether `path` exists at all (file, directory, or symlink).
    pub async fn exists(&mut self, path: impl Into<String>) -> Result<bool, Error> {
        Ok(self.stat(path).await?.is_some())
    }

    /// Whether `path` exists and is a directory.
    pub async fn isdir(&mut self, path: impl Into<String>) -> Result<bool, Error> {
        Ok(self.stat(path).await?.is_some_and(|i| i.is_dir()))
    }

    /// Lists a directory's children, with `.` and `..` filtered out.
    pub async fn listdir(&mut self, path: impl Into<String>) -> Result<Vec<String>, Error> {
        let mut entries = self.list_dir(path).await?;
        entries.retain(|e| e != "." && e != "..");
        Ok(entries)
    }

    /// Resolves one level of symlink indirection for `path`: if `path` is a
    /// symlink, joins its `LinkTarget` to `path`'s parent directory (unless
    /// the target is already absolute) and re-stats the result, returning
    /// the joined target path. Returns `path` unchanged otherwise.
    pub async fn resolve_path(&mut self, path: &str) -> Result<String, Error> {
        let info = self.get_file_info(path).await?;
        if info.is_symlink() {
            if let Some(target) = info.st_link_target {
                let resolved = if target.starts_with('/') {
                    target
                } else {
                    join_relative_to_parent(path, &target)
                };
                self.get_file_info(&resolved).await?;
                return Ok(resolved);
            }
        }
        Ok(path.to_string())
    }

    /// Reads an entire file's contents in one call.
    pub async fn get_file_contents(&mut self, path: impl Into<String>) -> Result<Vec<u8>, Error> {
        let path = path.into();
        let mut file = self.open(&path, AfcFopenMode::RdOnly).await?;
        let data = file.read().await?;
        file.close().await?;
        Ok(data)
    }

    /// Overwrites (or creates) a file with the given contents.
    pub async fn set_file_contents(
        &mut self,
        path: impl Into<String>,
        contents: &[u8],
    ) -> Result<(), Error> {
        let path = path.into();
        let mut file = self.open(&path, AfcFopenMode::WrOnly).await?;
        file.write(contents).await?;
        file.close().await?;
        Ok(())
    }

    /// Removes `path`, recursing into directories depth-first: children are
    /// deleted before the directory itself. With `force`, per-item failures
    /// (a child already gone, a permission error deeper in the tree) are
    /// logged and skipped instead of aborting the whole removal.
    pub async fn rm(&mut self, path: impl Into<String>, force: bool) -> Result<(), Error> {
        let path = path.into();
        let is_dir = match self.stat(&path).await? {
            Some(info) => info.is_dir(),
            None => return Ok(()),
        };

        if is_dir {
            let children = self.listdir(&path).await?;
            for child in children {
                let child_path = if path.ends_with('/') {
                    format!("{path}{child}")
                } else {
                    format!("{path}/{child}")
                };
                let result = Box::pin(self.rm(child_path, force)).await;
                match result {
                    Ok(()) => {}
                    Err(e) if force => warn!("ignoring error removing {path} child: {e}"),
                    Err(e) => return Err(e),
                }
            }
        }

        self.remove(path).await
    }

    /// Copies a local file to a path on the device.
    pub async fn push(&mut self, local: &std::path::Path, remote: impl Into<String>) -> Result<(), Error> {
        let data = tokio::fs::read(local).await?;
        self.set_file_contents(remote, &data).await
    }

    /// Depth-first walk of a directory tree, yielding `(dir, subdirs, files)`
    /// tuples in the style of Python's `os.walk`.
    pub async fn walk(
        &mut self,
        root: impl Into<String>,
    ) -> Result<Vec<(String, Vec<String>, Vec<String>)>, Error> {
        let root = root.into();
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(root);

        while let Some(dir) = queue.pop_front() {
            let entries = self.listdir(&dir).await?;
            let mut subdirs = Vec::new();
            let mut files = Vec::new();

            for entry in entries {
                let child = if dir.ends_with('/') {
                    format!("{dir}{entry}")
                } else {
                    format!("{dir}/{entry}")
                };
                let info = self.get_file_info(&child).await?;
                if info.is_dir() {
                    subdirs.push(entry);
                } else {
                    files.push(entry);
                }
            }

            for subdir in &subdirs {
                let child = if dir.ends_with('/') {
                    format!("{dir}{subdir}")
                } else {
                    format!("{dir}/{subdir}")
                };
                queue.push_back(child);
            }

            out.push((dir, subdirs, files));
        }

        Ok(out)
    }
}

impl<R: ReadWrite> std::fmt::Debug for AfcSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfcSession")
            .field("packet_num", &self.packet_num)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// A `Status` reply carrying an 8-byte little-endian status code.
    fn status_packet(packet_num: u64, code: u64) -> AfcPacket {
        AfcPacket {
            header: AfcPacketHeader {
                magic: MAGIC,
                entire_len: AfcPacketHeader::LEN + 8,
                header_payload_len: AfcPacketHeader::LEN + 8,
                packet_num,
                operation: AfcOpcode::Status,
            },
            header_payload: code.to_le_bytes().to_vec(),
            payload: Vec::new(),
        }
    }

    /// A `Data` reply carrying a raw, unprefixed response body — the shape
    /// every successful `ReadDir`/`GetFileInfo` response takes.
    fn data_packet(packet_num: u64, payload: Vec<u8>) -> AfcPacket {
        AfcPacket {
            header: AfcPacketHeader {
                magic: MAGIC,
                entire_len: AfcPacketHeader::LEN + payload.len() as u64,
                header_payload_len: AfcPacketHeader::LEN,
                packet_num,
                operation: AfcOpcode::Data,
            },
            header_payload: Vec::new(),
            payload,
        }
    }

    /// Reads one request off `server` and discards it, replying with `response`.
    async fn serve_one(server: &mut DuplexStream, response: AfcPacket) {
        let _req = AfcPacket::read(server).await.unwrap();
        response.write(server).await.unwrap();
    }

    #[tokio::test]
    async fn list_dir_parses_the_null_delimited_listing() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut session = AfcSession::new(client);

        let payload = b".\0..\0foo\0bar\0\0".to_vec();
        let response = data_packet(0, payload);

        let server_task = tokio::spawn(async move { serve_one(&mut server, response).await });
        let mut entries = session.list_dir("/DCIM").await.unwrap();
        server_task.await.unwrap();

        assert_eq!(entries, vec![".", "..", "foo", "bar"]);
        entries.retain(|e| e != "." && e != "..");
        assert_eq!(entries, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn get_file_info_parses_key_value_pairs() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut session = AfcSession::new(client);

        let mut payload = Vec::new();
        payload.extend_from_slice(b"st_size\0");
        payload.extend_from_slice(b"1024\0");
        payload.extend_from_slice(b"st_blocks\0");
        payload.extend_from_slice(b"2\0");
        payload.extend_from_slice(b"st_birthtime\0");
        payload.extend_from_slice(b"0\0");
        payload.extend_from_slice(b"st_mtime\0");
        payload.extend_from_slice(b"0\0");
        payload.extend_from_slice(b"st_nlink\0");
        payload.extend_from_slice(b"1\0");
        payload.extend_from_slice(b"st_ifmt\0");
        payload.extend_from_slice(b"S_IFREG\0\0");
        let response = data_packet(0, payload);

        let server_task = tokio::spawn(async move { serve_one(&mut server, response).await });
        let info = session.get_file_info("/DCIM/foo").await.unwrap();
        server_task.await.unwrap();

        assert_eq!(info.size, 1024);
        assert_eq!(info.st_ifmt, "S_IFREG");
        assert!(!info.is_dir());
    }

    #[tokio::test]
    async fn stat_maps_object_not_found_to_none() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut session = AfcSession::new(client);

        let response = status_packet(0, AfcError::ObjectNotFound as u64);

        let server_task = tokio::spawn(async move { serve_one(&mut server, response).await });
        let info = session.stat("/missing").await.unwrap();
        server_task.await.unwrap();

        assert!(info.is_none());
    }

    #[tokio::test]
    async fn rm_removes_leaf_then_parent() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut session = AfcSession::new(client);

        let server_task = tokio::spawn(async move {
            // stat(/dir): directory
            let mut info_payload = Vec::new();
            info_payload.extend_from_slice(b"st_size\0");
            info_payload.extend_from_slice(b"0\0");
            info_payload.extend_from_slice(b"st_blocks\0");
            info_payload.extend_from_slice(b"0\0");
            info_payload.extend_from_slice(b"st_birthtime\0");
            info_payload.extend_from_slice(b"0\0");
            info_payload.extend_from_slice(b"st_mtime\0");
            info_payload.extend_from_slice(b"0\0");
            info_payload.extend_from_slice(b"st_nlink\0");
            info_payload.extend_from_slice(b"1\0");
            info_payload.extend_from_slice(b"st_ifmt\0");
            info_payload.extend_from_slice(b"S_IFDIR\0\0");
            serve_one(&mut server, data_packet(0, info_payload.clone())).await;

            // listdir(/dir): one child "leaf"
            let listing = b".\0..\0leaf\0\0".to_vec();
            serve_one(&mut server, data_packet(0, listing)).await;

            // stat(/dir/leaf): regular file
            let mut leaf_info = info_payload.clone();
            let s_ifdir_at = leaf_info.len() - b"S_IFDIR\0\0".len();
            leaf_info[s_ifdir_at..].copy_from_slice(b"S_IFREG\0\0");
            serve_one(&mut server, data_packet(0, leaf_info)).await;

            // remove(/dir/leaf)
            serve_one(&mut server, status_packet(0, 0)).await;

            // remove(/dir)
            serve_one(&mut server, status_packet(0, 0)).await;

            server
        });

        session.rm("/dir", false).await.unwrap();
        server_task.await.unwrap();
    }
}
