//! Compiled compute modules, embedded from the build script's output.
//!
//! Eleven SPIR-V binaries back the thirteen operators: the two shuffle
//! sources are specialized per direction at pipeline creation, so each level
//! shares one module between its down and up stage.

use crate::plan::{Dir, Level, NormPhase, OpKind};

pub const FROM_IMAGE: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/spirv/from_image.spv"));
pub const TO_IMAGE: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/spirv/to_image.spv"));
pub const CONV_DOWN_LOW: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/spirv/conv_down_low.spv"));
pub const CONV_DOWN_HIGH: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/spirv/conv_down_high.spv"));
pub const CONV_UP_LOW: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/spirv/conv_up_low.spv"));
pub const CONV_UP_HIGH: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/spirv/conv_up_high.spv"));
pub const SHUFFLE_LOW: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/spirv/shuffle_low.spv"));
pub const SHUFFLE_HIGH: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/spirv/shuffle_high.spv"));
pub const NORM_SUM: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/spirv/norm_sum.spv"));
pub const NORM_COEFF: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/spirv/norm_coeff.spv"));
pub const NORM_SCALE: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/spirv/norm_scale.spv"));

pub const MODULE_COUNT: usize = 11;

/// Module binaries in `module_index` order.
pub const MODULES: [&[u8]; MODULE_COUNT] = [
    FROM_IMAGE,
    TO_IMAGE,
    CONV_DOWN_LOW,
    CONV_UP_LOW,
    CONV_DOWN_HIGH,
    CONV_UP_HIGH,
    SHUFFLE_LOW,
    SHUFFLE_HIGH,
    NORM_SUM,
    NORM_COEFF,
    NORM_SCALE,
];

/// The binary backing an operator's pipeline.
pub const fn module_index(op: OpKind) -> usize {
    match op {
        OpKind::Decode => 0,
        OpKind::Encode => 1,
        OpKind::Conv(Level::Low, Dir::Down) => 2,
        OpKind::Conv(Level::Low, Dir::Up) => 3,
        OpKind::Conv(Level::High, Dir::Down) => 4,
        OpKind::Conv(Level::High, Dir::Up) => 5,
        OpKind::Shuffle(Level::Low, _) => 6,
        OpKind::Shuffle(Level::High, _) => 7,
        OpKind::Norm(NormPhase::Sum) => 8,
        OpKind::Norm(NormPhase::Coeff) => 9,
        OpKind::Norm(NormPhase::Scale) => 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operator_maps_to_an_embedded_module() {
        for op in OpKind::ALL {
            assert!(module_index(op) < MODULE_COUNT);
        }
    }

    #[test]
    fn shuffle_directions_share_a_module() {
        assert_eq!(
            module_index(OpKind::Shuffle(Level::Low, Dir::Down)),
            module_index(OpKind::Shuffle(Level::Low, Dir::Up)),
        );
        assert_eq!(
            module_index(OpKind::Shuffle(Level::High, Dir::Down)),
            module_index(OpKind::Shuffle(Level::High, Dir::Up)),
        );
    }
}
