//! Decomposition of raw 16-bit pixel words into coarse, fine and gain codes.

use ndarray::{Array, ArrayBase, Data, Dimension, Zip};
use serde::{Deserialize, Serialize};

/// Position of one sub-code inside the raw word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    pub shift: u32,
    pub width: u32,
}

impl BitField {
    pub const fn new(shift: u32, width: u32) -> Self {
        Self { shift, width }
    }

    #[inline]
    pub fn mask(&self) -> u16 {
        ((1u32 << self.width) - 1) as u16
    }

    /// Largest code this field can hold.
    pub fn max_code(&self) -> u16 {
        self.mask()
    }

    #[inline]
    pub fn extract(&self, raw: u16) -> u8 {
        ((raw >> self.shift) & self.mask()) as u8
    }

    fn bits(&self) -> u32 {
        ((1u32 << self.width) - 1) << self.shift
    }
}

/// Bit layout of a raw pixel word.
///
/// The default matches the descrambled DLSraw word `[X, Gn Gn, Fn x8, Crs x5]`
/// read from the most significant bit down: coarse in bits 0..5, fine in
/// bits 5..13, gain in bits 13..15. Bit 15 is unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitLayout {
    pub fine: BitField,
    pub coarse: BitField,
    pub gain: BitField,
}

impl Default for BitLayout {
    fn default() -> Self {
        Self {
            coarse: BitField::new(0, 5),
            fine: BitField::new(5, 8),
            gain: BitField::new(13, 2),
        }
    }
}

/// Decoded sub-codes of one raw word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdcCode {
    pub coarse: u8,
    pub fine: u8,
    pub gain: u8,
}

impl BitLayout {
    /// Checks that every field fits in a byte, lies inside 16 bits and no two overlap.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [("fine", self.fine), ("coarse", self.coarse), ("gain", self.gain)];
        for (name, field) in fields {
            if field.width == 0 || field.width > 8 {
                return Err(format!("{name} width must be 1..=8 bits, got {}", field.width));
            }
            if field.shift + field.width > 16 {
                return Err(format!(
                    "{name} field {}..{} exceeds 16 bits",
                    field.shift,
                    field.shift + field.width
                ));
            }
        }
        if self.fine.bits() & self.coarse.bits() != 0
            || self.fine.bits() & self.gain.bits() != 0
            || self.coarse.bits() & self.gain.bits() != 0
        {
            return Err("bit fields overlap".to_string());
        }
        Ok(())
    }

    #[inline]
    pub fn split(&self, raw: u16) -> AdcCode {
        AdcCode {
            coarse: self.coarse.extract(raw),
            fine: self.fine.extract(raw),
            gain: self.gain.extract(raw),
        }
    }

    /// Splits every word of `raw` into three code arrays of the same shape.
    pub fn split_array<S, D>(&self, raw: &ArrayBase<S, D>) -> SplitCodes<D>
    where
        S: Data<Elem = u16>,
        D: Dimension,
    {
        let mut out = SplitCodes {
            coarse: Array::zeros(raw.raw_dim()),
            fine: Array::zeros(raw.raw_dim()),
            gain: Array::zeros(raw.raw_dim()),
        };
        Zip::from(raw)
            .and(&mut out.coarse)
            .and(&mut out.fine)
            .and(&mut out.gain)
            .for_each(|&word, coarse, fine, gain| {
                let code = self.split(word);
                *coarse = code.coarse;
                *fine = code.fine;
                *gain = code.gain;
            });
        out
    }
}

/// Coarse, fine and gain code arrays decoded from one raw array.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitCodes<D: Dimension> {
    pub coarse: Array<u8, D>,
    pub fine: Array<u8, D>,
    pub gain: Array<u8, D>,
}
