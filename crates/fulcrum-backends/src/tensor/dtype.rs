//! Element types and their storage geometry

use serde::Serialize;
use std::fmt;

/// Element type of a tensor.
///
/// Block-quantized types pack `block_size()` logical elements into
/// `type_size()` bytes; plain types have a block size of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    F32,
    F16,
    Bf16,
    I8,
    I16,
    I32,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Mxfp4,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Iq2Xxs,
    Iq2Xs,
    Iq3Xxs,
    Iq3S,
    Iq2S,
    Iq1S,
    Iq1M,
    Iq4Nl,
    Iq4Xs,
}

impl DataType {
    /// Every supported type, in declaration order.
    pub const ALL: [DataType; 26] = [
        DataType::F32,
        DataType::F16,
        DataType::Bf16,
        DataType::I8,
        DataType::I16,
        DataType::I32,
        DataType::Q4_0,
        DataType::Q4_1,
        DataType::Q5_0,
        DataType::Q5_1,
        DataType::Q8_0,
        DataType::Mxfp4,
        DataType::Q2K,
        DataType::Q3K,
        DataType::Q4K,
        DataType::Q5K,
        DataType::Q6K,
        DataType::Iq2Xxs,
        DataType::Iq2Xs,
        DataType::Iq3Xxs,
        DataType::Iq3S,
        DataType::Iq2S,
        DataType::Iq1S,
        DataType::Iq1M,
        DataType::Iq4Nl,
        DataType::Iq4Xs,
    ];

    /// Logical elements per storage block.
    pub const fn block_size(self) -> usize {
        match self {
            DataType::F32 | DataType::F16 | DataType::Bf16 | DataType::I8 | DataType::I16 | DataType::I32 => 1,
            DataType::Q4_0
            | DataType::Q4_1
            | DataType::Q5_0
            | DataType::Q5_1
            | DataType::Q8_0
            | DataType::Mxfp4
            | DataType::Iq4Nl => 32,
            _ => 256,
        }
    }

    /// Bytes per storage block.
    pub const fn type_size(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 | DataType::Bf16 | DataType::I16 => 2,
            DataType::I8 => 1,
            DataType::Q4_0 => 18,
            DataType::Q4_1 => 20,
            DataType::Q5_0 => 22,
            DataType::Q5_1 => 24,
            DataType::Q8_0 => 34,
            DataType::Mxfp4 => 17,
            DataType::Q2K => 84,
            DataType::Q3K => 110,
            DataType::Q4K => 144,
            DataType::Q5K => 176,
            DataType::Q6K => 210,
            DataType::Iq2Xxs => 66,
            DataType::Iq2Xs => 74,
            DataType::Iq3Xxs => 98,
            DataType::Iq3S => 110,
            DataType::Iq2S => 82,
            DataType::Iq1S => 50,
            DataType::Iq1M => 56,
            DataType::Iq4Nl => 18,
            DataType::Iq4Xs => 136,
        }
    }

    pub const fn is_quantized(self) -> bool {
        self.block_size() > 1
    }

    /// f32, f16 or bf16.
    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F16 | DataType::Bf16)
    }

    /// Bytes occupied by a row of `ne0` elements.
    pub const fn row_size(self, ne0: i64) -> usize {
        self.type_size() * (ne0 as usize) / self.block_size()
    }

    /// Lower-case name used in logs and kernel function names.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::Bf16 => "bf16",
            DataType::I8 => "i8",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::Q4_0 => "q4_0",
            DataType::Q4_1 => "q4_1",
            DataType::Q5_0 => "q5_0",
            DataType::Q5_1 => "q5_1",
            DataType::Q8_0 => "q8_0",
            DataType::Mxfp4 => "mxfp4",
            DataType::Q2K => "q2_K",
            DataType::Q3K => "q3_K",
            DataType::Q4K => "q4_K",
            DataType::Q5K => "q5_K",
            DataType::Q6K => "q6_K",
            DataType::Iq2Xxs => "iq2_xxs",
            DataType::Iq2Xs => "iq2_xs",
            DataType::Iq3Xxs => "iq3_xxs",
            DataType::Iq3S => "iq3_s",
            DataType::Iq2S => "iq2_s",
            DataType::Iq1S => "iq1_s",
            DataType::Iq1M => "iq1_m",
            DataType::Iq4Nl => "iq4_nl",
            DataType::Iq4Xs => "iq4_xs",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
