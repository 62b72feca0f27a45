//! Wire codec for the `MEMORY_MAP` control-pipe payload.
//!
//! When the engine (re)binds a sidecar to the arena it sends one
//! `PluginMemoryMapping` record - the shm path, the offset of the shared
//! condition, the block size and the port count - followed by one
//! `PortMapping` record per plugin port. All offsets are relative to the
//! arena base; the sidecar computes absolute pointers after mapping.
//!
//! Fields travel in native byte order: both ends of the pipe always run on
//! the same machine.

use cadenza_core::{EngineError, Result};

/// Fixed width of the shm path field.
pub const SHMEM_PATH_MAX: usize = 4096;

/// Encoded size of the header record.
pub const MAPPING_HEADER_SIZE: usize = SHMEM_PATH_MAX + 8 + 4 + 4;

/// Encoded size of one port record.
pub const PORT_RECORD_SIZE: usize = 4 + 8;

/// Header of a memory-map message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMemoryMapping {
    /// Name of the shared-memory object backing the arena.
    pub shmem_path: String,
    /// Offset of the `PluginCond` within the arena.
    pub cond_offset: u64,
    /// Current block size in frames.
    pub block_size: u32,
    /// Number of `PortMapping` records that follow.
    pub num_buffers: u32,
}

/// Where one plugin port reads or writes its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub port_index: u32,
    pub offset: u64,
}

impl PluginMemoryMapping {
    /// Total encoded size for a mapping with `num_buffers` ports.
    pub fn encoded_size(num_buffers: usize) -> usize {
        MAPPING_HEADER_SIZE + num_buffers * PORT_RECORD_SIZE
    }

    /// Serialize the header plus `ports` into one payload.
    pub fn encode(&self, ports: &[PortMapping]) -> Vec<u8> {
        debug_assert_eq!(self.num_buffers as usize, ports.len());

        let mut out = Vec::with_capacity(Self::encoded_size(ports.len()));
        let mut path = [0u8; SHMEM_PATH_MAX];
        let bytes = self.shmem_path.as_bytes();
        let len = bytes.len().min(SHMEM_PATH_MAX - 1);
        path[..len].copy_from_slice(&bytes[..len]);
        out.extend_from_slice(&path);
        out.extend_from_slice(&self.cond_offset.to_ne_bytes());
        out.extend_from_slice(&self.block_size.to_ne_bytes());
        out.extend_from_slice(&self.num_buffers.to_ne_bytes());

        for port in ports {
            out.extend_from_slice(&port.port_index.to_ne_bytes());
            out.extend_from_slice(&port.offset.to_ne_bytes());
        }
        out
    }

    /// Parse a payload produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<(Self, Vec<PortMapping>)> {
        if bytes.len() < MAPPING_HEADER_SIZE {
            return Err(EngineError::Error(format!(
                "memory map payload too short: {} bytes",
                bytes.len()
            )));
        }

        let path_end = bytes[..SHMEM_PATH_MAX]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SHMEM_PATH_MAX);
        let shmem_path = std::str::from_utf8(&bytes[..path_end])
            .map_err(|_| EngineError::Error("memory map path is not valid utf-8".into()))?
            .to_owned();

        let mut at = SHMEM_PATH_MAX;
        let cond_offset = u64::from_ne_bytes(bytes[at..at + 8].try_into().unwrap());
        at += 8;
        let block_size = u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap());
        at += 4;
        let num_buffers = u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap());
        at += 4;

        let expected = Self::encoded_size(num_buffers as usize);
        if bytes.len() < expected {
            return Err(EngineError::Error(format!(
                "memory map payload truncated: {} of {expected} bytes",
                bytes.len()
            )));
        }

        let mut ports = Vec::with_capacity(num_buffers as usize);
        for _ in 0..num_buffers {
            let port_index = u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap());
            at += 4;
            let offset = u64::from_ne_bytes(bytes[at..at + 8].try_into().unwrap());
            at += 8;
            ports.push(PortMapping { port_index, offset });
        }

        Ok((
            Self {
                shmem_path,
                cond_offset,
                block_size,
                num_buffers,
            },
            ports,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mapping = PluginMemoryMapping {
            shmem_path: "/cadenza-bufferarena-5f00aa-1234beef".into(),
            cond_offset: 4096,
            block_size: 128,
            num_buffers: 3,
        };
        let ports = vec![
            PortMapping {
                port_index: 0,
                offset: 0,
            },
            PortMapping {
                port_index: 1,
                offset: 512,
            },
            PortMapping {
                port_index: 2,
                offset: 1024,
            },
        ];

        let bytes = mapping.encode(&ports);
        assert_eq!(bytes.len(), PluginMemoryMapping::encoded_size(3));

        let (decoded, decoded_ports) = PluginMemoryMapping::decode(&bytes).unwrap();
        assert_eq!(decoded, mapping);
        assert_eq!(decoded_ports, ports);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let mapping = PluginMemoryMapping {
            shmem_path: "/arena".into(),
            cond_offset: 0,
            block_size: 64,
            num_buffers: 2,
        };
        let ports = [
            PortMapping {
                port_index: 0,
                offset: 0,
            },
            PortMapping {
                port_index: 1,
                offset: 64,
            },
        ];
        let bytes = mapping.encode(&ports);

        assert!(PluginMemoryMapping::decode(&bytes[..100]).is_err());
        assert!(PluginMemoryMapping::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_zero_ports() {
        let mapping = PluginMemoryMapping {
            shmem_path: "/arena".into(),
            cond_offset: 128,
            block_size: 256,
            num_buffers: 0,
        };
        let bytes = mapping.encode(&[]);
        let (decoded, ports) = PluginMemoryMapping::decode(&bytes).unwrap();
        assert_eq!(decoded.cond_offset, 128);
        assert!(ports.is_empty());
    }
}
