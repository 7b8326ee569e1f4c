//! Connection descriptor passed to a node on its command line

use crate::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Everything a node needs to reach its manager
///
/// Text form: `<socket_path>|<shm_name>|<shm_size>|`, trailing pipe included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub socket_path: PathBuf,
    pub shm_name: String,
    pub shm_size: u32,
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|",
            self.socket_path.display(),
            self.shm_name,
            self.shm_size
        )
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .unwrap_or(s);
        let body = s
            .strip_suffix('|')
            .ok_or_else(|| Error::Parse(format!("missing trailing '|' in {:?}", s)))?;

        let mut fields = body.split('|');
        let (socket_path, shm_name, shm_size) = match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(socket), Some(name), Some(size), None) => (socket, name, size),
            _ => return Err(Error::Parse(format!("expected 3 fields in {:?}", s))),
        };

        if socket_path.is_empty() {
            return Err(Error::Parse("empty socket path".to_string()));
        }
        if shm_name.is_empty() {
            return Err(Error::Parse("empty shared memory name".to_string()));
        }
        let shm_size = shm_size
            .parse::<u32>()
            .map_err(|e| Error::Parse(format!("shared memory size {:?}: {}", shm_size, e)))?;

        Ok(Self {
            socket_path: PathBuf::from(socket_path),
            shm_name: shm_name.to_string(),
            shm_size,
        })
    }
}
