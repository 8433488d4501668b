use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda {
        device_id: u32,
    },
}

impl FromStr for Device {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.eq_ignore_ascii_case("cpu") {
            return Ok(Device::Cpu);
        }
        if let Some(rest) = raw.strip_prefix("cuda:") {
            let device_id = rest
                .parse()
                .map_err(|_| format!("invalid cuda device id: {rest}"))?;
            return Ok(Device::Cuda { device_id });
        }
        Err(format!("unsupported device: {raw} (expected cpu or cuda:N)"))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    U8,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::U8 => "u8",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorDesc {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn byte_len(&self) -> usize {
        self.shape.numel() * self.dtype.byte_size()
    }
}

/// Owned tensor on the network side of the slot protocol.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub bytes: Bytes,
}

impl Tensor {
    pub fn from_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        Self {
            desc: TensorDesc { dtype, shape },
            bytes,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn expected_byte_len(&self) -> usize {
        self.desc.byte_len()
    }
}

/// Location of a tensor inside a named shared region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferRef {
    pub region: String,
    pub offset: usize,
}

/// Immutable description of a tensor that lives in shared memory.
///
/// The descriptor never owns the bytes; the region it points at is mutated
/// in place by whichever side currently owns the slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub desc: TensorDesc,
    pub buffer: BufferRef,
}

impl TensorDescriptor {
    pub fn new(desc: TensorDesc, region: impl Into<String>) -> Self {
        Self {
            desc,
            buffer: BufferRef {
                region: region.into(),
                offset: 0,
            },
        }
    }

    /// Byte range inside the region.
    pub fn span(&self) -> std::ops::Range<usize> {
        self.buffer.offset..self.buffer.offset + self.desc.byte_len()
    }
}

/// Borrowed view of a tensor backed by a shared buffer.
#[derive(Debug)]
pub struct TensorView<'a> {
    pub desc: &'a TensorDesc,
    pub bytes: &'a [u8],
}

/// Mutable view of a tensor backed by a shared buffer.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    pub desc: &'a TensorDesc,
    pub bytes: &'a mut [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_numel_and_display() {
        let shape = Shape::from_slice(&[1, 3, 224, 224]);
        assert_eq!(shape.rank(), 4);
        assert_eq!(shape.numel(), 150_528);
        assert_eq!(shape.to_string(), "[1, 3, 224, 224]");
    }

    #[test]
    fn desc_byte_len_uses_dtype_width() {
        let desc = TensorDesc::new(DType::I64, Shape::from_slice(&[2, 5]));
        assert_eq!(desc.byte_len(), 80);
    }

    #[test]
    fn device_parsing() {
        assert_eq!("CPU".parse::<Device>(), Ok(Device::Cpu));
        assert_eq!(
            "cuda:1".parse::<Device>(),
            Ok(Device::Cuda { device_id: 1 })
        );
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn descriptor_span_starts_at_offset() {
        let desc = TensorDesc::new(DType::F32, Shape::from_slice(&[1, 4]));
        let mut d = TensorDescriptor::new(desc, "input0");
        d.buffer.offset = 8;
        assert_eq!(d.span(), 8..24);
    }

    #[test]
    fn dtype_serde_names() {
        let dtype: DType = serde_json::from_str("\"f16\"").unwrap();
        assert_eq!(dtype, DType::F16);
        assert_eq!(serde_json::to_string(&DType::U8).unwrap(), "\"u8\"");
    }
}
