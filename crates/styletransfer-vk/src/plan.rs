//! Host-side description of the network: channel constants, weight-blob
//! layout, tensor scratch layout, dispatch geometry, and the ordered
//! forward-pass plan.
//!
//! Everything in this module is plain data derived from the image extent; no
//! Vulkan handle appears here. The GPU-facing modules consume these tables,
//! so dispatch sizing, weight addressing, and barrier placement have a single
//! definition that tests exercise without a device.

use bytemuck::{Pod, Zeroable};

/// Channels of the image boundary (RGB).
pub const IMAGE_CHANNELS: u32 = 3;
/// Channels produced by the low-path strided convolution (3 groups of 5).
pub const CONV_LOW_CHANNELS: u32 = 15;
/// Channels produced by the low-path shuffle and consumed by normalization.
pub const SHUFFLE_LOW_CHANNELS: u32 = 16;
/// Channels of the high path (16 groups of 4 on the way down).
pub const HIGH_CHANNELS: u32 = 64;

const KERNEL_TAPS: u32 = 3 * 3;

/// Minimum dynamic-uniform-binding alignment on the device classes this
/// targets; every weight-slice offset is a multiple of it.
pub const UNIFORM_SLICE_ALIGN: u64 = 256;

/// std140 vec4 granularity of the shader-declared parameter blocks.
const BLOCK_WORD_ALIGN: u64 = 16;

/// Bytes of the normalization statistics vector: one (sum, sum-of-squares)
/// pair per channel, rewritten in place to (mean, 1/sigma).
pub const NORM_STATS_LEN: u64 = 2 * SHUFFLE_LOW_CHANNELS as u64 * 4;

pub const fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

const fn max_u64(a: u64, b: u64) -> u64 {
    if a > b { a } else { b }
}

/// A 2D pixel extent, laid out to match the 8-byte push-constant block every
/// operator receives.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// The next resolution level down, rounding odd dimensions up.
    pub const fn halved(self) -> Self {
        Self {
            width: self.width.div_ceil(2),
            height: self.height.div_ceil(2),
        }
    }

    pub const fn pixels(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// The three resolutions the network runs at, derived once at construction
/// and never recomputed per dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extents {
    pub full: Extent,
    pub low: Extent,
    pub high: Extent,
}

impl Extents {
    pub const fn new(full: Extent) -> Self {
        let low = full.halved();
        Self {
            full,
            low,
            high: low.halved(),
        }
    }
}

/// One stage's parameters inside the packed weight blob.
///
/// `file_offset` addresses the tightly packed weight file; `offset` is the
/// 256-aligned position the slice is scattered to on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightSlice {
    pub floats: u32,
    pub offset: u64,
    pub file_offset: u64,
}

impl WeightSlice {
    pub const fn len(&self) -> u64 {
        self.floats as u64 * 4
    }

    pub const fn aligned_len(&self) -> u64 {
        align_up(self.len(), UNIFORM_SLICE_ALIGN)
    }
}

pub const WEIGHT_SLICE_COUNT: usize = 9;

/// Per-slice parameter counts in file order: low conv down, low shuffle
/// down, norm scale+bias, high conv down, high shuffle down, high shuffle
/// up, high conv up, low shuffle up, low conv up.
const SLICE_FLOATS: [u32; WEIGHT_SLICE_COUNT] = [
    CONV_LOW_CHANNELS * KERNEL_TAPS + CONV_LOW_CHANNELS,
    SHUFFLE_LOW_CHANNELS * CONV_LOW_CHANNELS,
    2 * SHUFFLE_LOW_CHANNELS,
    HIGH_CHANNELS * KERNEL_TAPS + HIGH_CHANNELS,
    HIGH_CHANNELS * HIGH_CHANNELS,
    HIGH_CHANNELS * HIGH_CHANNELS + HIGH_CHANNELS,
    HIGH_CHANNELS * KERNEL_TAPS + SHUFFLE_LOW_CHANNELS,
    CONV_LOW_CHANNELS * SHUFFLE_LOW_CHANNELS + CONV_LOW_CHANNELS,
    CONV_LOW_CHANNELS * KERNEL_TAPS + IMAGE_CHANNELS,
];

const fn build_slices() -> [WeightSlice; WEIGHT_SLICE_COUNT] {
    let mut slices = [WeightSlice {
        floats: 0,
        offset: 0,
        file_offset: 0,
    }; WEIGHT_SLICE_COUNT];
    let mut offset = 0;
    let mut file_offset = 0;
    let mut i = 0;
    while i < WEIGHT_SLICE_COUNT {
        slices[i] = WeightSlice {
            floats: SLICE_FLOATS[i],
            offset,
            file_offset,
        };
        offset += slices[i].aligned_len();
        file_offset += slices[i].len();
        i += 1;
    }
    slices
}

pub const WEIGHT_SLICES: [WeightSlice; WEIGHT_SLICE_COUNT] = build_slices();

const LAST_SLICE: WeightSlice = WEIGHT_SLICES[WEIGHT_SLICE_COUNT - 1];

/// Exact byte length of a valid weight file (tightly packed floats).
pub const WEIGHT_FILE_LEN: u64 = LAST_SLICE.file_offset + LAST_SLICE.len();

/// Capacity of the device weight buffer: every slice at its aligned offset.
pub const WEIGHT_BUFFER_LEN: u64 = LAST_SLICE.offset + LAST_SLICE.aligned_len();

/// Direction of a convolution or shuffle stage through the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    Down = 0,
    Up = 1,
}

/// The six weight descriptor sets. Families whose down and up slices share a
/// parameter-block shape cover both through a bind-time dynamic offset; the
/// two high-shuffle slices differ (the up matrix carries a bias tail) and
/// get a set each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightFamily {
    ConvLow,
    ShuffleLow,
    Norm,
    ConvHigh,
    ShuffleHighDown,
    ShuffleHighUp,
}

impl WeightFamily {
    pub const COUNT: usize = 6;

    pub const ALL: [WeightFamily; Self::COUNT] = [
        WeightFamily::ConvLow,
        WeightFamily::ShuffleLow,
        WeightFamily::Norm,
        WeightFamily::ConvHigh,
        WeightFamily::ShuffleHighDown,
        WeightFamily::ShuffleHighUp,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    const fn slice_pair(self) -> (usize, Option<usize>) {
        match self {
            WeightFamily::ConvLow => (0, Some(8)),
            WeightFamily::ShuffleLow => (1, Some(7)),
            WeightFamily::Norm => (2, None),
            WeightFamily::ConvHigh => (3, Some(6)),
            WeightFamily::ShuffleHighDown => (4, None),
            WeightFamily::ShuffleHighUp => (5, None),
        }
    }

    /// Device offset of the slice the descriptor set is written with.
    pub const fn base_offset(self) -> u64 {
        WEIGHT_SLICES[self.slice_pair().0].offset
    }

    /// Offset passed at bind time, relative to the set's base. A multiple of
    /// 256 by construction of the slice table.
    pub const fn dynamic_offset(self, dir: Dir) -> u32 {
        match (dir, self.slice_pair().1) {
            (Dir::Up, Some(up)) => {
                (WEIGHT_SLICES[up].offset - self.base_offset()) as u32
            }
            _ => 0,
        }
    }

    /// Byte size of the uniform block the family's shaders declare. The
    /// descriptor range must equal this (the driver validates range against
    /// the declared block, not against the raw parameter count). The two
    /// high-shuffle sets share one module, so both carry its biased size.
    pub const fn block_len(self) -> u64 {
        let (down, up) = self.slice_pair();
        let raw = match self {
            WeightFamily::ShuffleHighDown | WeightFamily::ShuffleHighUp => {
                max_u64(WEIGHT_SLICES[4].len(), WEIGHT_SLICES[5].len())
            }
            _ => match up {
                Some(up) => max_u64(WEIGHT_SLICES[down].len(), WEIGHT_SLICES[up].len()),
                None => WEIGHT_SLICES[down].len(),
            },
        };
        align_up(raw, BLOCK_WORD_ALIGN)
    }
}

/// Resolution level of a convolution or shuffle stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Phase of the three-dispatch instance normalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormPhase {
    Sum,
    Coeff,
    Scale,
}

/// The closed set of network stages. Each value corresponds to exactly one
/// compute pipeline in the operator registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Decode,
    Encode,
    Conv(Level, Dir),
    Shuffle(Level, Dir),
    Norm(NormPhase),
}

/// Immutable dispatch-sizing constants of one operator, baked into its
/// pipeline through specialization at registry construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpShape {
    pub local_x: u32,
    pub local_y: u32,
    pub depth_groups: u32,
}

impl OpKind {
    pub const COUNT: usize = 13;

    pub const ALL: [OpKind; Self::COUNT] = [
        OpKind::Decode,
        OpKind::Encode,
        OpKind::Conv(Level::Low, Dir::Down),
        OpKind::Conv(Level::Low, Dir::Up),
        OpKind::Conv(Level::High, Dir::Down),
        OpKind::Conv(Level::High, Dir::Up),
        OpKind::Shuffle(Level::Low, Dir::Down),
        OpKind::Shuffle(Level::Low, Dir::Up),
        OpKind::Shuffle(Level::High, Dir::Down),
        OpKind::Shuffle(Level::High, Dir::Up),
        OpKind::Norm(NormPhase::Sum),
        OpKind::Norm(NormPhase::Coeff),
        OpKind::Norm(NormPhase::Scale),
    ];

    pub const fn index(self) -> usize {
        match self {
            OpKind::Decode => 0,
            OpKind::Encode => 1,
            OpKind::Conv(Level::Low, Dir::Down) => 2,
            OpKind::Conv(Level::Low, Dir::Up) => 3,
            OpKind::Conv(Level::High, Dir::Down) => 4,
            OpKind::Conv(Level::High, Dir::Up) => 5,
            OpKind::Shuffle(Level::Low, Dir::Down) => 6,
            OpKind::Shuffle(Level::Low, Dir::Up) => 7,
            OpKind::Shuffle(Level::High, Dir::Down) => 8,
            OpKind::Shuffle(Level::High, Dir::Up) => 9,
            OpKind::Norm(NormPhase::Sum) => 10,
            OpKind::Norm(NormPhase::Coeff) => 11,
            OpKind::Norm(NormPhase::Scale) => 12,
        }
    }

    pub const fn shape(self) -> OpShape {
        let (local_x, local_y, depth_groups) = match self {
            OpKind::Decode | OpKind::Encode => (16, 16, 1),
            OpKind::Conv(Level::Low, _) => (8, 8, IMAGE_CHANNELS),
            OpKind::Conv(Level::High, _) => (8, 8, SHUFFLE_LOW_CHANNELS),
            OpKind::Shuffle(Level::Low, Dir::Down) => (64, 1, SHUFFLE_LOW_CHANNELS),
            OpKind::Shuffle(Level::Low, Dir::Up) => (64, 1, CONV_LOW_CHANNELS),
            OpKind::Shuffle(Level::High, _) => (64, 1, HIGH_CHANNELS),
            OpKind::Norm(NormPhase::Sum) => (256, 1, SHUFFLE_LOW_CHANNELS),
            OpKind::Norm(NormPhase::Coeff) => (16, 1, 1),
            OpKind::Norm(NormPhase::Scale) => (64, 1, SHUFFLE_LOW_CHANNELS),
        };
        OpShape {
            local_x,
            local_y,
            depth_groups,
        }
    }

    pub const fn weight_family(self) -> Option<WeightFamily> {
        match self {
            OpKind::Decode | OpKind::Encode => None,
            OpKind::Conv(Level::Low, _) => Some(WeightFamily::ConvLow),
            OpKind::Conv(Level::High, _) => Some(WeightFamily::ConvHigh),
            OpKind::Shuffle(Level::Low, _) => Some(WeightFamily::ShuffleLow),
            OpKind::Shuffle(Level::High, Dir::Down) => Some(WeightFamily::ShuffleHighDown),
            OpKind::Shuffle(Level::High, Dir::Up) => Some(WeightFamily::ShuffleHighUp),
            OpKind::Norm(_) => Some(WeightFamily::Norm),
        }
    }

    /// Values handed to pipeline specialization. IDs start at 1; some
    /// drivers mishandle a workgroup size bound to constant 0. Shuffles get
    /// the extended block with direction, source channel count, and bias
    /// presence; every other operator takes the plain three-field shape.
    pub const fn spec_constants(self) -> SpecConstants {
        let shape = self.shape();
        match self {
            OpKind::Shuffle(level, dir) => {
                let src_channels = match (level, dir) {
                    (Level::Low, Dir::Down) => CONV_LOW_CHANNELS,
                    (Level::Low, Dir::Up) => SHUFFLE_LOW_CHANNELS,
                    (Level::High, _) => HIGH_CHANNELS,
                };
                let has_bias = match dir {
                    Dir::Down => 0,
                    Dir::Up => 1,
                };
                SpecConstants {
                    values: [
                        shape.local_x,
                        shape.local_y,
                        shape.depth_groups,
                        dir as u32,
                        src_channels,
                        has_bias,
                    ],
                    len: 6,
                }
            }
            _ => SpecConstants {
                values: [shape.local_x, shape.local_y, shape.depth_groups, 0, 0, 0],
                len: 3,
            },
        }
    }
}

/// Specialization payload of one pipeline: `len` leading entries of
/// `values`, mapped to constant IDs 1 through `len`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpecConstants {
    pub values: [u32; 6],
    pub len: usize,
}

/// One of the three same-sized scratch regions a frame's tensor buffer is
/// partitioned into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Third {
    Start,
    Mid,
    End,
}

impl Third {
    pub const COUNT: usize = 3;

    pub const ALL: [Third; Self::COUNT] = [Third::Start, Third::Mid, Third::End];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn offset(self, chunk: u64) -> u64 {
        self.index() as u64 * chunk
    }
}

/// Byte size of one scratch third: the high-resolution 64-channel tensor,
/// the largest activation in the network, rounded up so the third offsets
/// stay storage-binding aligned.
pub const fn chunk_len(high: Extent) -> u64 {
    align_up(
        high.pixels() * HIGH_CHANNELS as u64 * 4,
        UNIFORM_SLICE_ALIGN,
    )
}

/// Byte size of one frame's whole scratch buffer.
pub const fn scratch_len(high: Extent) -> u64 {
    Third::COUNT as u64 * chunk_len(high)
}

/// Exact descriptor-pool multiplicities for a frame count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSizes {
    pub storage_images: u32,
    pub storage_buffers: u32,
    pub dynamic_uniforms: u32,
    pub max_sets: u32,
}

pub const fn pool_sizes(frames: u32) -> PoolSizes {
    PoolSizes {
        storage_images: 2 * frames,
        storage_buffers: Third::COUNT as u32 * frames,
        dynamic_uniforms: WeightFamily::COUNT as u32,
        max_sets: 5 * frames + WeightFamily::COUNT as u32,
    }
}

/// Which of the two per-frame images a codec pass touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageRole {
    Input,
    Output,
}

/// Weight set and bind-time dynamic offset of one pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightBinding {
    pub family: WeightFamily,
    pub dynamic_offset: u32,
}

/// Descriptor sets a pass binds. `src` maps to set 0 and `dst` to set 1 of
/// the compute layout; a pass that works in place still reads and writes
/// through its `dst` set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    ImageTensor { image: ImageRole, tensor: Third },
    TensorPair {
        src: Third,
        dst: Third,
        weights: WeightBinding,
    },
}

/// One recorded dispatch: operator, bindings, push-constant extent, and
/// workgroup counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pass {
    pub op: OpKind,
    pub binding: Binding,
    pub push: Extent,
    pub groups: [u32; 3],
}

impl Pass {
    /// Thirds whose prior contents this pass consumes.
    pub fn tensor_reads(&self) -> Vec<Third> {
        match (self.op, self.binding) {
            (OpKind::Decode, _) => Vec::new(),
            (_, Binding::ImageTensor { tensor, .. }) => vec![tensor],
            (OpKind::Norm(NormPhase::Coeff), Binding::TensorPair { dst, .. }) => vec![dst],
            (OpKind::Norm(NormPhase::Scale), Binding::TensorPair { src, dst, .. }) => {
                vec![src, dst]
            }
            (_, Binding::TensorPair { src, .. }) => vec![src],
        }
    }

    /// Thirds this pass overwrites.
    pub fn tensor_writes(&self) -> Vec<Third> {
        match (self.op, self.binding) {
            (OpKind::Encode, _) => Vec::new(),
            (_, Binding::ImageTensor { tensor, .. }) => vec![tensor],
            (_, Binding::TensorPair { dst, .. }) => vec![dst],
        }
    }
}

/// One element of the recorded command sequence. Barriers stand for a
/// whole-buffer compute-to-compute memory barrier on the frame's scratch
/// buffer; the surrounding image transitions are the orchestrator's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanItem {
    Pass(Pass),
    Barrier,
}

const fn plane_groups(drive: Extent, shape: OpShape) -> [u32; 3] {
    [
        drive.width.div_ceil(shape.local_x),
        drive.height.div_ceil(shape.local_y),
        shape.depth_groups,
    ]
}

const fn linear_groups(drive: Extent, shape: OpShape) -> [u32; 3] {
    [
        drive.pixels().div_ceil(shape.local_x as u64) as u32,
        1,
        shape.depth_groups,
    ]
}

/// The full forward pass as data: thirteen dispatches in network order with
/// a barrier between every dependent pair. Deterministic in `extents`.
pub fn forward_plan(extents: &Extents) -> Vec<PlanItem> {
    use Dir::{Down, Up};
    use Level::{High, Low};
    use Third::{End, Mid, Start};

    let x = *extents;
    let compute = |op: OpKind, src: Third, dst: Third, dir: Dir, push: Extent, groups: [u32; 3]| {
        let family = op
            .weight_family()
            .expect("every non-codec operator owns a weight family");
        Pass {
            op,
            binding: Binding::TensorPair {
                src,
                dst,
                weights: WeightBinding {
                    family,
                    dynamic_offset: family.dynamic_offset(dir),
                },
            },
            push,
            groups,
        }
    };

    let passes = [
        // Image into the start third at full resolution.
        Pass {
            op: OpKind::Decode,
            binding: Binding::ImageTensor {
                image: ImageRole::Input,
                tensor: Start,
            },
            push: x.full,
            groups: plane_groups(x.full, OpKind::Decode.shape()),
        },
        // Down the low path: strided conv, then the dense channel mix.
        compute(
            OpKind::Conv(Low, Down),
            Start,
            End,
            Down,
            x.full,
            plane_groups(x.low, OpKind::Conv(Low, Down).shape()),
        ),
        compute(
            OpKind::Shuffle(Low, Down),
            End,
            Mid,
            Down,
            x.low,
            linear_groups(x.low, OpKind::Shuffle(Low, Down).shape()),
        ),
        // Instance normalization over the mid third; the statistics vector
        // lives at the head of the end third until the scale phase consumes
        // it.
        compute(
            OpKind::Norm(NormPhase::Sum),
            Mid,
            End,
            Down,
            x.low,
            [1, 1, OpKind::Norm(NormPhase::Sum).shape().depth_groups],
        ),
        compute(
            OpKind::Norm(NormPhase::Coeff),
            Mid,
            End,
            Down,
            x.low,
            [1, 1, 1],
        ),
        compute(
            OpKind::Norm(NormPhase::Scale),
            End,
            Mid,
            Down,
            x.low,
            linear_groups(x.low, OpKind::Norm(NormPhase::Scale).shape()),
        ),
        // Down the high path.
        compute(
            OpKind::Conv(High, Down),
            Mid,
            End,
            Down,
            x.low,
            plane_groups(x.high, OpKind::Conv(High, Down).shape()),
        ),
        compute(
            OpKind::Shuffle(High, Down),
            End,
            Mid,
            Down,
            x.high,
            linear_groups(x.high, OpKind::Shuffle(High, Down).shape()),
        ),
        // Back up: mirrored stages with their own parameters.
        compute(
            OpKind::Shuffle(High, Up),
            Mid,
            End,
            Up,
            x.high,
            linear_groups(x.high, OpKind::Shuffle(High, Up).shape()),
        ),
        compute(
            OpKind::Conv(High, Up),
            End,
            Mid,
            Up,
            x.low,
            plane_groups(x.low, OpKind::Conv(High, Up).shape()),
        ),
        compute(
            OpKind::Shuffle(Low, Up),
            Mid,
            End,
            Up,
            x.low,
            linear_groups(x.low, OpKind::Shuffle(Low, Up).shape()),
        ),
        compute(
            OpKind::Conv(Low, Up),
            End,
            Start,
            Up,
            x.full,
            plane_groups(x.full, OpKind::Conv(Low, Up).shape()),
        ),
        // Start third back out to the image.
        Pass {
            op: OpKind::Encode,
            binding: Binding::ImageTensor {
                image: ImageRole::Output,
                tensor: Start,
            },
            push: x.full,
            groups: plane_groups(x.full, OpKind::Encode.shape()),
        },
    ];

    let mut plan = Vec::with_capacity(2 * passes.len());
    for pass in passes {
        if !plan.is_empty() {
            plan.push(PlanItem::Barrier);
        }
        plan.push(PlanItem::Pass(pass));
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_triple_halves_with_ceiling() {
        let x = Extents::new(Extent::new(1920, 1080));
        assert_eq!(x.low, Extent::new(960, 540));
        assert_eq!(x.high, Extent::new(480, 270));

        let odd = Extents::new(Extent::new(1919, 1079));
        assert_eq!(odd.low, Extent::new(960, 540));
        assert_eq!(odd.high, Extent::new(480, 270));

        let tiny = Extents::new(Extent::new(1, 1));
        assert_eq!(tiny.low, Extent::new(1, 1));
        assert_eq!(tiny.high, Extent::new(1, 1));
    }

    #[test]
    fn slice_offsets_increase_and_stay_aligned() {
        let mut expected = 0;
        for slice in WEIGHT_SLICES {
            assert_eq!(slice.offset, expected);
            assert_eq!(slice.offset % UNIFORM_SLICE_ALIGN, 0);
            expected = slice.offset + slice.aligned_len();
        }
        assert_eq!(expected, WEIGHT_BUFFER_LEN);
    }

    #[test]
    fn file_layout_is_tight() {
        let mut expected = 0;
        for slice in WEIGHT_SLICES {
            assert_eq!(slice.file_offset, expected);
            expected += slice.len();
        }
        assert_eq!(expected, WEIGHT_FILE_LEN);
        assert_eq!(WEIGHT_FILE_LEN, 41_212);
        assert_eq!(WEIGHT_BUFFER_LEN, 41_984);
    }

    #[test]
    fn weight_buffer_covers_every_slice() {
        assert!(WEIGHT_BUFFER_LEN >= WEIGHT_FILE_LEN);
        for slice in WEIGHT_SLICES {
            assert!(slice.offset + slice.len() <= WEIGHT_BUFFER_LEN);
            assert!(WEIGHT_BUFFER_LEN >= slice.len());
        }
    }

    #[test]
    fn families_address_the_buffer_in_bounds() {
        for family in WeightFamily::ALL {
            for dir in [Dir::Down, Dir::Up] {
                let dynamic = family.dynamic_offset(dir) as u64;
                assert_eq!(dynamic % UNIFORM_SLICE_ALIGN, 0);
                assert!(family.base_offset() + dynamic + family.block_len() <= WEIGHT_BUFFER_LEN);
            }
        }
    }

    #[test]
    fn family_blocks_cover_their_slices() {
        let members: [(WeightFamily, &[usize]); 6] = [
            (WeightFamily::ConvLow, &[0, 8]),
            (WeightFamily::ShuffleLow, &[1, 7]),
            (WeightFamily::Norm, &[2]),
            (WeightFamily::ConvHigh, &[3, 6]),
            (WeightFamily::ShuffleHighDown, &[4]),
            (WeightFamily::ShuffleHighUp, &[5]),
        ];
        for (family, slices) in members {
            for &slice in slices {
                assert!(family.block_len() >= WEIGHT_SLICES[slice].len());
            }
            assert_eq!(family.block_len() % BLOCK_WORD_ALIGN, 0);
        }
        // The shared high-shuffle module declares the biased block for both
        // directions.
        assert_eq!(
            WeightFamily::ShuffleHighDown.block_len(),
            WeightFamily::ShuffleHighUp.block_len()
        );
    }

    #[test]
    fn chunk_dominates_every_stage_tensor() {
        for (w, h) in [(1, 1), (17, 31), (1919, 1079), (3840, 2160)] {
            let x = Extents::new(Extent::new(w, h));
            let chunk = chunk_len(x.high);
            let tensors = [
                x.full.pixels() * IMAGE_CHANNELS as u64 * 4,
                x.low.pixels() * CONV_LOW_CHANNELS as u64 * 4,
                x.low.pixels() * SHUFFLE_LOW_CHANNELS as u64 * 4,
                x.high.pixels() * HIGH_CHANNELS as u64 * 4,
                NORM_STATS_LEN,
            ];
            for tensor in tensors {
                assert!(tensor <= chunk, "{w}x{h}: {tensor} > {chunk}");
            }
            assert_eq!(scratch_len(x.high), 3 * chunk);
        }
    }

    #[test]
    fn pool_sizes_match_the_fixed_multipliers() {
        for frames in 1..=4 {
            let sizes = pool_sizes(frames);
            assert_eq!(sizes.storage_images, 2 * frames);
            assert_eq!(sizes.storage_buffers, 3 * frames);
            assert_eq!(sizes.dynamic_uniforms, 6);
            assert_eq!(sizes.max_sets, 5 * frames + 6);
        }
    }

    #[test]
    fn one_pixel_extent_never_zeroes_a_dispatch() {
        let plan = forward_plan(&Extents::new(Extent::new(1, 1)));
        for item in &plan {
            if let PlanItem::Pass(pass) = item {
                for count in pass.groups {
                    assert!(count >= 1, "{:?} dispatches zero groups", pass.op);
                }
            }
        }
    }

    #[test]
    fn plan_orders_all_thirteen_stages() {
        let plan = forward_plan(&Extents::new(Extent::new(1920, 1080)));
        let ops: Vec<OpKind> = plan
            .iter()
            .filter_map(|item| match item {
                PlanItem::Pass(pass) => Some(pass.op),
                PlanItem::Barrier => None,
            })
            .collect();
        assert_eq!(
            ops,
            [
                OpKind::Decode,
                OpKind::Conv(Level::Low, Dir::Down),
                OpKind::Shuffle(Level::Low, Dir::Down),
                OpKind::Norm(NormPhase::Sum),
                OpKind::Norm(NormPhase::Coeff),
                OpKind::Norm(NormPhase::Scale),
                OpKind::Conv(Level::High, Dir::Down),
                OpKind::Shuffle(Level::High, Dir::Down),
                OpKind::Shuffle(Level::High, Dir::Up),
                OpKind::Conv(Level::High, Dir::Up),
                OpKind::Shuffle(Level::Low, Dir::Up),
                OpKind::Conv(Level::Low, Dir::Up),
                OpKind::Encode,
            ]
        );
        // A barrier sits between every adjacent pair of passes.
        assert_eq!(plan.len(), 2 * ops.len() - 1);
        for (i, item) in plan.iter().enumerate() {
            if i % 2 == 0 {
                assert!(matches!(item, PlanItem::Pass(_)));
            } else {
                assert_eq!(*item, PlanItem::Barrier);
            }
        }
    }

    #[test]
    fn spec_constants_carry_direction_for_shuffles() {
        let down = OpKind::Shuffle(Level::High, Dir::Down).spec_constants();
        let up = OpKind::Shuffle(Level::High, Dir::Up).spec_constants();
        assert_eq!(down.len, 6);
        assert_eq!(down.values[3], 0);
        assert_eq!(down.values[5], 0);
        assert_eq!(up.values[3], 1);
        assert_eq!(up.values[5], 1);

        let conv = OpKind::Conv(Level::Low, Dir::Down).spec_constants();
        assert_eq!(conv.len, 3);
        assert_eq!(conv.values[..3], [8, 8, 3]);
    }

    #[test]
    fn operator_indices_are_a_permutation() {
        let mut seen = [false; OpKind::COUNT];
        for op in OpKind::ALL {
            let index = op.index();
            assert!(!seen[index]);
            seen[index] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
