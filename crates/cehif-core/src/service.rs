//! Service-to-pipe topology.
//!
//! Upper layers address traffic by service, not by pipe. This table is
//! the host's half of a symmetric mapping also held by the target
//! firmware (it is downloaded at bring-up); the two must change in
//! lockstep.

use crate::config::{CE_ATTR_DIS_INTR, HOST_CE_CONFIG};
use crate::error::{CeError, Result};

/// Logical service identifiers carried by the message layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceId {
    RsvdCtrl = 1,
    WmiControl = 2,
    WmiDataBe = 3,
    WmiDataBk = 4,
    WmiDataVi = 5,
    WmiDataVo = 6,
    HttDataMsg = 7,
    TestRawStreams = 8,
}

/// Direction of one mapping entry, target's point of view mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PipeDir {
    /// Host to target (upload).
    Out = 1,
    /// Target to host (download).
    In = 2,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceMapEntry {
    pub service: ServiceId,
    pub dir: PipeDir,
    pub pipe: u8,
}

const fn entry(service: ServiceId, dir: PipeDir, pipe: u8) -> ServiceMapEntry {
    ServiceMapEntry { service, dir, pipe }
}

/// The fixed service map, downloaded to the target at bring-up.
pub const SERVICE_TO_PIPE: &[ServiceMapEntry] = &[
    entry(ServiceId::WmiDataVo, PipeDir::Out, 3),
    entry(ServiceId::WmiDataVo, PipeDir::In, 2),
    entry(ServiceId::WmiDataBk, PipeDir::Out, 3),
    entry(ServiceId::WmiDataBk, PipeDir::In, 2),
    entry(ServiceId::WmiDataBe, PipeDir::Out, 3),
    entry(ServiceId::WmiDataBe, PipeDir::In, 2),
    entry(ServiceId::WmiDataVi, PipeDir::Out, 3),
    entry(ServiceId::WmiDataVi, PipeDir::In, 2),
    entry(ServiceId::WmiControl, PipeDir::Out, 3),
    entry(ServiceId::WmiControl, PipeDir::In, 2),
    entry(ServiceId::RsvdCtrl, PipeDir::Out, 0),
    entry(ServiceId::RsvdCtrl, PipeDir::In, 1),
    entry(ServiceId::TestRawStreams, PipeDir::Out, 0),
    entry(ServiceId::TestRawStreams, PipeDir::In, 1),
    entry(ServiceId::HttDataMsg, PipeDir::Out, 4),
    entry(ServiceId::HttDataMsg, PipeDir::In, 1),
];

/// Serialize the map for the bring-up download (LE words, 12-byte stride).
pub fn service_map_bytes() -> Vec<u8> {
    let mut out = Vec::with_capacity((SERVICE_TO_PIPE.len() + 1) * 12);
    for e in SERVICE_TO_PIPE {
        out.extend_from_slice(&(e.service as u32).to_le_bytes());
        out.extend_from_slice(&(e.dir as u32).to_le_bytes());
        out.extend_from_slice(&(e.pipe as u32).to_le_bytes());
    }
    // terminator
    out.extend_from_slice(&[0u8; 12]);
    out
}

/// Resolved pipe assignment for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePipes {
    /// Host-to-target pipe.
    pub ul_pipe: u8,
    /// Target-to-host pipe.
    pub dl_pipe: u8,
    /// The upload pipe runs with interrupts disabled and must be polled
    /// via `send_complete_check`.
    pub ul_polled: bool,
}

/// Look up the pipe pair for a service.
pub fn map_service_to_pipe(service: ServiceId) -> Result<ServicePipes> {
    let mut ul = None;
    let mut dl = None;
    for e in SERVICE_TO_PIPE {
        if e.service != service {
            continue;
        }
        match e.dir {
            PipeDir::Out => ul = Some(e.pipe),
            PipeDir::In => dl = Some(e.pipe),
        }
    }
    match (ul, dl) {
        (Some(ul_pipe), Some(dl_pipe)) => Ok(ServicePipes {
            ul_pipe,
            dl_pipe,
            ul_polled: HOST_CE_CONFIG[ul_pipe as usize].flags & CE_ATTR_DIS_INTR != 0,
        }),
        _ => Err(CeError::UnknownService(service as u16)),
    }
}

/// The control pipe pair used before any service negotiation.
pub fn default_pipes() -> ServicePipes {
    // RsvdCtrl is always mapped.
    map_service_to_pipe(ServiceId::RsvdCtrl).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wmi_maps_to_command_pipes() {
        let p = map_service_to_pipe(ServiceId::WmiControl).unwrap();
        assert_eq!(p.ul_pipe, 3);
        assert_eq!(p.dl_pipe, 2);
        assert!(!p.ul_polled);
    }

    #[test]
    fn test_htt_upload_is_polled() {
        let p = map_service_to_pipe(ServiceId::HttDataMsg).unwrap();
        assert_eq!(p.ul_pipe, 4);
        assert_eq!(p.dl_pipe, 1);
        assert!(p.ul_polled);
    }

    #[test]
    fn test_default_pipes() {
        let p = default_pipes();
        assert_eq!(p.ul_pipe, 0);
        assert_eq!(p.dl_pipe, 1);
    }

    #[test]
    fn test_map_bytes_terminated() {
        let bytes = service_map_bytes();
        assert_eq!(bytes.len() % 12, 0);
        assert_eq!(&bytes[bytes.len() - 12..], &[0u8; 12]);
    }
}
