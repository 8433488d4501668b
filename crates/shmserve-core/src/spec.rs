use serde::{Deserialize, Serialize};

use crate::{DType, Shape, TensorDesc};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IOName(pub String);

impl std::fmt::Display for IOName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl TensorSpec {
    /// The concrete shape, if every dimension is fixed.
    pub fn fixed_shape(&self) -> Option<Shape> {
        let dims = self.dims.iter().copied().collect::<Option<Vec<_>>>()?;
        Some(Shape::from_slice(&dims))
    }

    /// Bytes needed to hold one tensor of this spec; `None` for dynamic specs.
    pub fn byte_len(&self) -> Option<usize> {
        self.fixed_shape()
            .map(|shape| shape.numel() * self.dtype.byte_size())
    }

    /// Checks a tensor against the declared signature.
    ///
    /// Returns a human-readable message suitable for an `InvalidArgument`
    /// status on mismatch.
    pub fn check(&self, desc: &TensorDesc) -> Result<(), String> {
        if desc.dtype != self.dtype {
            return Err(format!(
                "input '{}' has dtype {}, model expects {}",
                self.name, desc.dtype, self.dtype
            ));
        }
        let dims = desc.shape.dims();
        let matches = dims.len() == self.dims.len()
            && dims
                .iter()
                .zip(&self.dims)
                .all(|(got, want)| *got > 0 && want.is_none_or(|w| w == *got));
        if !matches {
            return Err(format!(
                "input '{}' has shape {}, model expects {}",
                self.name,
                desc.shape,
                render_dims(&self.dims)
            ));
        }
        Ok(())
    }
}

fn render_dims(dims: &[Option<usize>]) -> String {
    let parts = dims
        .iter()
        .map(|d| d.map_or_else(|| "-1".to_string(), |d| d.to_string()))
        .collect::<Vec<_>>();
    format!("[{}]", parts.join(", "))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl ModelSpec {
    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|spec| spec.name.0 == name)
    }
}

/// What the model directory hands out for a resolved `(name, version)`.
#[derive(Clone, Debug)]
pub struct ModelHandle {
    pub name: String,
    pub version: u64,
    pub spec: ModelSpec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionState {
    Available,
    Loading,
    Failed,
    Unloading,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelStatusEntry {
    pub model: String,
    pub version: u64,
    pub state: VersionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dims: Vec<Option<usize>>) -> TensorSpec {
        TensorSpec {
            name: IOName("input".to_string()),
            dtype: DType::F32,
            dims,
        }
    }

    #[test]
    fn fixed_shape_requires_all_dims() {
        assert_eq!(
            spec(vec![Some(1), Some(4)]).byte_len(),
            Some(16)
        );
        assert_eq!(spec(vec![None, Some(4)]).fixed_shape(), None);
    }

    #[test]
    fn check_accepts_dynamic_dims() {
        let s = spec(vec![None, Some(4)]);
        let desc = TensorDesc::new(DType::F32, Shape::from_slice(&[7, 4]));
        assert!(s.check(&desc).is_ok());
    }

    #[test]
    fn check_reports_shape_mismatch() {
        let s = spec(vec![Some(1), Some(4)]);
        let desc = TensorDesc::new(DType::F32, Shape::from_slice(&[1, 5]));
        let msg = s.check(&desc).unwrap_err();
        assert!(msg.contains("[1, 5]"), "{msg}");
        assert!(msg.contains("[1, 4]"), "{msg}");
    }

    #[test]
    fn check_reports_dtype_mismatch() {
        let s = spec(vec![Some(1), Some(4)]);
        let desc = TensorDesc::new(DType::I32, Shape::from_slice(&[1, 4]));
        assert!(s.check(&desc).unwrap_err().contains("dtype i32"));
    }

    #[test]
    fn check_rejects_zero_dims_on_dynamic_axis() {
        let s = spec(vec![None, Some(4)]);
        let desc = TensorDesc::new(DType::F32, Shape::from_slice(&[0, 4]));
        assert!(s.check(&desc).is_err());
    }
}
