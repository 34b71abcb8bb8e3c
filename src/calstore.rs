//! Oscillator calibration persistence. The store holds a magic word at
//! offset 0 and the ppm value as an IEEE-754 float at offset 4; any other
//! magic means no calibration has ever been written.

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use crate::traits::Eeprom;

pub const CAL_MAGIC: u32 = 0x1234_5678;
pub const CAL_PPM_LIMIT: f32 = 200.0;

const MAGIC_OFFSET: usize = 0;
const PPM_OFFSET: usize = 4;

pub fn save<E: Eeprom>(eeprom: &mut E, ppm: f32) -> Result<()> {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, CAL_MAGIC);
    eeprom.write(MAGIC_OFFSET, &buf)?;
    LittleEndian::write_f32(&mut buf, ppm);
    eeprom.write(PPM_OFFSET, &buf)?;
    Ok(())
}

/// Returns the stored ppm, or None when the magic is absent or the stored
/// value is outside the hard calibration limit.
pub fn load<E: Eeprom>(eeprom: &mut E) -> Result<Option<f32>> {
    let mut buf = [0u8; 4];
    eeprom.read(MAGIC_OFFSET, &mut buf)?;
    if LittleEndian::read_u32(&buf) != CAL_MAGIC {
        return Ok(None);
    }

    eeprom.read(PPM_OFFSET, &mut buf)?;
    let ppm = LittleEndian::read_f32(&buf);
    if !ppm.is_finite() || ppm.abs() > CAL_PPM_LIMIT {
        return Ok(None);
    }
    Ok(Some(ppm))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct RamEeprom {
        bytes: Vec<u8>,
    }

    impl RamEeprom {
        fn new() -> Self {
            RamEeprom {
                bytes: vec![0xFF; 16],
            }
        }
    }

    impl Eeprom for RamEeprom {
        fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
            buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
            Ok(())
        }
        fn write(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
            self.bytes[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    #[test]
    fn test_blank_store_loads_nothing() {
        let mut eeprom = RamEeprom::new();
        assert_eq!(load(&mut eeprom).unwrap(), None);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut eeprom = RamEeprom::new();
        for ppm in [-200.0f32, -12.34, 0.0, 0.001, 57.9, 200.0] {
            save(&mut eeprom, ppm).unwrap();
            let loaded = load(&mut eeprom).unwrap().expect("value should load");
            assert!((loaded - ppm).abs() < f32::EPSILON, "ppm {}", ppm);
        }
    }

    #[test]
    fn test_out_of_range_value_rejected() {
        let mut eeprom = RamEeprom::new();
        save(&mut eeprom, 350.0).unwrap();
        assert_eq!(load(&mut eeprom).unwrap(), None);
    }

    #[test]
    fn test_corrupt_magic_rejected() {
        let mut eeprom = RamEeprom::new();
        save(&mut eeprom, 42.0).unwrap();
        eeprom.write(0, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(load(&mut eeprom).unwrap(), None);
    }
}
