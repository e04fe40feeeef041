//! Per-pipe attribute tables and transport constants.
//!
//! These tables are fixed at build time and must match the symmetric
//! tables held by the target firmware; changing pipe counts, directions,
//! entry counts or buffer sizes requires updating both sides in lockstep.

/// Number of copy engines / pipes.
pub const CE_COUNT: usize = 8;

/// The last CE is reserved for the diagnostic window.
pub const DIAG_CE_ID: u8 = (CE_COUNT - 1) as u8;

/// Largest single diagnostic descriptor.
pub const DIAG_TRANSFER_LIMIT: u32 = 2048;

/// Host side pipe attribute flags.
pub const CE_ATTR_DIS_INTR: u32 = 0x1;

/// Host-side attributes of one copy engine.
#[derive(Debug, Clone, Copy)]
pub struct CeAttr {
    pub flags: u32,
    /// Send-ring entries (0 = no send ring on this pipe).
    pub src_nentries: u32,
    /// Buffer size for this pipe, both directions.
    pub buf_sz: u32,
    /// Receive-ring entries (0 = no receive ring on this pipe).
    pub dest_nentries: u32,
}

impl CeAttr {
    pub const fn unused() -> Self {
        Self {
            flags: 0,
            src_nentries: 0,
            buf_sz: 0,
            dest_nentries: 0,
        }
    }
}

/// Host copy engine configuration.
///
/// Entry counts are powers of two (ring requirement). One send slot per
/// pipe is reserved to disambiguate full from empty, so the usable send
/// window is `src_nentries - 1`.
pub const HOST_CE_CONFIG: [CeAttr; CE_COUNT] = [
    // CE0: host->target control
    CeAttr { flags: 0, src_nentries: 16, buf_sz: 256, dest_nentries: 0 },
    // CE1: target->host control + data
    CeAttr { flags: 0, src_nentries: 0, buf_sz: 512, dest_nentries: 512 },
    // CE2: target->host command replies
    CeAttr { flags: 0, src_nentries: 0, buf_sz: 2048, dest_nentries: 32 },
    // CE3: host->target commands
    CeAttr { flags: 0, src_nentries: 32, buf_sz: 2048, dest_nentries: 0 },
    // CE4: host->target frames, polled (interrupts disabled)
    CeAttr { flags: CE_ATTR_DIS_INTR, src_nentries: 256, buf_sz: 256, dest_nentries: 0 },
    // CE5: unused
    CeAttr::unused(),
    // CE6: reserved for target-autonomous copies
    CeAttr::unused(),
    // CE7: the diagnostic window
    CeAttr { flags: 0, src_nentries: 2, buf_sz: DIAG_TRANSFER_LIMIT, dest_nentries: 2 },
];

/// Target-side view of one pipe, downloaded at bring-up.
#[derive(Debug, Clone, Copy)]
pub struct TargetCeConfig {
    pub pipe_num: u32,
    /// 1 = out (host->target), 2 = in, 3 = inout.
    pub pipe_dir: u32,
    pub nentries: u32,
    pub nbytes_max: u32,
    pub flags: u32,
}

impl TargetCeConfig {
    /// Serialize for the diagnostic-window download (LE words, fixed
    /// 20-byte stride).
    pub fn write_le(&self, out: &mut Vec<u8>) {
        for w in [self.pipe_num, self.pipe_dir, self.nentries, self.nbytes_max, self.flags] {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }
}

pub const TARGET_CE_CONFIG: [TargetCeConfig; 7] = [
    TargetCeConfig { pipe_num: 0, pipe_dir: 1, nentries: 32, nbytes_max: 256, flags: 0 },
    TargetCeConfig { pipe_num: 1, pipe_dir: 2, nentries: 32, nbytes_max: 512, flags: 0 },
    TargetCeConfig { pipe_num: 2, pipe_dir: 2, nentries: 32, nbytes_max: 2048, flags: 0 },
    TargetCeConfig { pipe_num: 3, pipe_dir: 1, nentries: 32, nbytes_max: 2048, flags: 0 },
    TargetCeConfig { pipe_num: 4, pipe_dir: 1, nentries: 256, nbytes_max: 256, flags: 0 },
    TargetCeConfig { pipe_num: 5, pipe_dir: 1, nentries: 32, nbytes_max: 2048, flags: 0 },
    TargetCeConfig { pipe_num: 6, pipe_dir: 3, nentries: 32, nbytes_max: 4096, flags: 0 },
    // CE7 is host-only and not downloaded.
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_counts_are_powers_of_two() {
        for (i, attr) in HOST_CE_CONFIG.iter().enumerate() {
            for n in [attr.src_nentries, attr.dest_nentries] {
                assert!(n == 0 || n.is_power_of_two(), "CE{} entries {}", i, n);
            }
        }
    }

    #[test]
    fn test_diag_pipe_shape() {
        let diag = &HOST_CE_CONFIG[DIAG_CE_ID as usize];
        assert_eq!(diag.buf_sz, DIAG_TRANSFER_LIMIT);
        assert!(diag.src_nentries > 0 && diag.dest_nentries > 0);
    }

    #[test]
    fn test_target_config_serialization() {
        let mut out = Vec::new();
        TARGET_CE_CONFIG[0].write_le(&mut out);
        assert_eq!(out.len(), 20);
        assert_eq!(&out[0..4], &0u32.to_le_bytes());
        assert_eq!(&out[12..16], &256u32.to_le_bytes());
    }
}
