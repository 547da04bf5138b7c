use std::sync::Arc;

use crate::error::{OrchestraError, Result};

/// Raw bytes of a single tensor.
pub type Tensor = Vec<u8>;

/// Tensor type tag for contiguous native-endian `f32` buffers.
pub const TENSOR_F32: &str = "f32";

/// An immutable, ordered sequence of opaque tensors holding the weights of a model.
///
/// Cloning is cheap, every clone shares the same underlying buffers. Two sets are
/// equal whenever their tensors (and tensor type tag) are equal byte by byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSet {
    tensors: Arc<[Tensor]>,
    tensor_type: Arc<str>,
}

impl ParameterSet {
    /// Creates a new `ParameterSet`.
    ///
    /// # Arguments
    /// * `tensors` - The raw tensors, in the order the participants expect them.
    /// * `tensor_type` - A free form tag describing how the bytes are laid out.
    ///
    /// # Returns
    /// A new `ParameterSet` instance.
    pub fn new(tensors: Vec<Tensor>, tensor_type: impl Into<String>) -> Self {
        Self {
            tensors: Arc::from(tensors),
            tensor_type: Arc::from(tensor_type.into()),
        }
    }

    /// Creates an empty `ParameterSet` with the `f32` tensor tag.
    pub fn empty() -> Self {
        Self::new(Vec::new(), TENSOR_F32)
    }

    /// Encodes a list of `f32` tensors.
    ///
    /// # Arguments
    /// * `tensors` - The flat values of every tensor.
    ///
    /// # Returns
    /// A new `ParameterSet` tagged as `f32`.
    pub fn from_f32<T: AsRef<[f32]>>(tensors: &[T]) -> Self {
        let tensors = tensors
            .iter()
            .map(|t| bytemuck::cast_slice::<f32, u8>(t.as_ref()).to_vec())
            .collect();

        Self::new(tensors, TENSOR_F32)
    }

    /// Decodes every tensor as a flat `f32` buffer.
    ///
    /// # Returns
    /// The decoded tensors or a `MalformedTensor` error if some tensor's byte length
    /// isn't a multiple of the size of an `f32`.
    pub fn to_f32(&self) -> Result<Vec<Vec<f32>>> {
        self.tensors
            .iter()
            .enumerate()
            .map(|(index, tensor)| {
                if tensor.len() % size_of::<f32>() != 0 {
                    return Err(OrchestraError::MalformedTensor {
                        index,
                        len: tensor.len(),
                    });
                }

                Ok(bytemuck::pod_collect_to_vec::<u8, f32>(tensor))
            })
            .collect()
    }

    /// The tensors of this set, in order.
    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn tensor_type(&self) -> &str {
        &self.tensor_type
    }

    /// The amount of tensors in this set.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}
