// Length-prefixed JSON blocks (stage_config, ldc_config)
//
//   offset  size    field
//      0     4      payload length, u32 LE
//      4   <=2048   UTF-8 JSON
//
// The writer zeroes the header, writes the payload and zeroes the tail, then
// stores the length. Readers treat 0 or an oversize length as no valid config.

use std::path::Path;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::segment::Segment;
use crate::error::{Result, StageError};

pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD: usize = 2048;
pub const CONFIG_BLOCK_SIZE: usize = HEADER_LEN + MAX_PAYLOAD;

const READ_ATTEMPTS: usize = 5;

pub struct ConfigBlock {
    segment: Segment,
}

impl ConfigBlock {
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        Ok(Self {
            segment: Segment::create(dir, name, CONFIG_BLOCK_SIZE)?,
        })
    }

    pub fn attach(dir: &Path, name: &str) -> Result<Self> {
        Ok(Self {
            segment: Segment::attach(dir, name, CONFIG_BLOCK_SIZE)?,
        })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Replace the stored value
    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.write_raw(&payload)
    }

    fn write_raw(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD {
            return Err(StageError::InvalidConfig(format!(
                "payload of {} bytes does not fit in '{}' (max {})",
                payload.len(),
                self.segment.name(),
                MAX_PAYLOAD
            )));
        }

        self.segment.atomic_u32(0)?.store(0, Ordering::Release);
        self.segment.store(HEADER_LEN, payload)?;
        self.segment
            .zero(HEADER_LEN + payload.len(), MAX_PAYLOAD - payload.len())?;
        self.segment
            .atomic_u32(0)?
            .store((payload.len() as u32).to_le(), Ordering::Release);

        debug!("Wrote {} bytes to '{}'", payload.len(), self.segment.name());
        Ok(())
    }

    /// Current payload as text, without parsing it
    pub fn read_raw(&self) -> Result<String> {
        let header = self.segment.atomic_u32(0)?;
        let len = u32::from_le(header.load(Ordering::Acquire)) as usize;
        if len == 0 || len > MAX_PAYLOAD {
            return Err(StageError::InvalidConfig(format!(
                "'{}' holds no valid payload (length {len})",
                self.segment.name()
            )));
        }
        let mut payload = vec![0u8; len];
        self.segment.load(HEADER_LEN, &mut payload)?;
        String::from_utf8(payload).map_err(|e| StageError::InvalidConfig(e.to_string()))
    }

    /// Parse the stored value, retrying briefly if a writer is mid-update
    pub fn read<T: DeserializeOwned>(&self) -> Result<T> {
        let mut last_error = StageError::InvalidConfig(format!("'{}' is empty", self.segment.name()));
        for _ in 0..READ_ATTEMPTS {
            match self
                .read_raw()
                .and_then(|text| serde_json::from_str(&text).map_err(|e| StageError::InvalidConfig(e.to_string())))
            {
                Ok(value) => return Ok(value),
                Err(e) => last_error = e,
            }
            std::thread::yield_now();
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfiguration;
    use crate::motor::Axis;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct LdcConfig {
        current_limit_ma: f64,
        tec_setpoint_c: f64,
        channel: u8,
    }

    #[test]
    fn test_stage_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut block = ConfigBlock::create(dir.path(), "stage_config").unwrap();
        let peer = ConfigBlock::attach(dir.path(), "stage_config").unwrap();

        let mut config = StageConfiguration::default();
        config.position_limits.insert(Axis::X, (-100.0, 100.0));
        block.write(&config).unwrap();

        let back: StageConfiguration = peer.read().unwrap();
        assert_eq!(back, config);

        let raw = std::fs::read(dir.path().join("stage_config")).unwrap();
        let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        assert_eq!(len, config.to_json().unwrap().len());
        assert!(raw[HEADER_LEN + len..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_other_schema_shares_framing() {
        let dir = tempfile::tempdir().unwrap();
        let mut block = ConfigBlock::create(dir.path(), "ldc_config").unwrap();
        let ldc = LdcConfig {
            current_limit_ma: 120.0,
            tec_setpoint_c: 25.0,
            channel: 1,
        };
        block.write(&ldc).unwrap();
        assert_eq!(block.read::<LdcConfig>().unwrap(), ldc);
    }

    #[test]
    fn test_shorter_payload_clears_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut block = ConfigBlock::create(dir.path(), "tail").unwrap();
        block.write(&"x".repeat(500)).unwrap();
        block.write(&"y").unwrap();
        assert_eq!(block.read::<String>().unwrap(), "y");
        let raw = std::fs::read(dir.path().join("tail")).unwrap();
        assert!(raw[HEADER_LEN + 3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_invalid_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut block = ConfigBlock::create(dir.path(), "bad").unwrap();

        // Freshly created: length 0
        assert!(matches!(block.read::<StageConfiguration>(), Err(StageError::InvalidConfig(_))));

        // Too large to store
        assert!(matches!(
            block.write(&"z".repeat(MAX_PAYLOAD)),
            Err(StageError::InvalidConfig(_))
        ));

        // Header claims more than the maximum
        block.segment.atomic_u32(0).unwrap().store((MAX_PAYLOAD as u32 + 1).to_le(), Ordering::Release);
        assert!(matches!(block.read_raw(), Err(StageError::InvalidConfig(_))));

        // Valid framing, wrong schema
        block.write(&LdcConfig {
            current_limit_ma: 1.0,
            tec_setpoint_c: 2.0,
            channel: 0,
        })
        .unwrap();
        assert!(matches!(block.read::<StageConfiguration>(), Err(StageError::InvalidConfig(_))));
    }
}
