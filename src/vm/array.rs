//! Zero-filled array allocation.
//!
//! [`NdArray::empty`] is the plain allocation primitive and makes no promise
//! about contents. [`create_zero_filled_array`] allocates through it and then
//! clears the whole buffer, whatever the shape or element type.
use crate::error::ArrayError;
use serde::{Deserialize, Serialize};

/// Byte pattern `empty` leaves behind, so nothing can rely on fresh memory
/// happening to be zero.
const UNINIT_FILL: u8 = 0xA5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Complex64,
    Complex128,
}

impl ElementType {
    pub const fn size(self) -> usize {
        match self {
            ElementType::Bool | ElementType::Int8 | ElementType::UInt8 => 1,
            ElementType::Int16 | ElementType::UInt16 => 2,
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
            ElementType::Int64
            | ElementType::UInt64
            | ElementType::Float64
            | ElementType::Complex64 => 8,
            ElementType::Complex128 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ArrayLayout {
    /// C order: last index varies fastest.
    #[default]
    RowMajor,
    /// Fortran order: first index varies fastest.
    ColumnMajor,
}

#[derive(Debug, Clone)]
pub struct NdArray {
    dims: Vec<usize>,
    strides: Vec<usize>,
    element: ElementType,
    layout: ArrayLayout,
    data: Vec<u8>,
}

impl NdArray {
    /// Allocate an array without initializing its contents.
    pub fn empty(
        dims: &[usize],
        element: ElementType,
        layout: ArrayLayout,
    ) -> Result<Self, ArrayError> {
        let too_large = || ArrayError::TooLarge {
            dims: dims.to_vec(),
            element_size: element.size(),
        };
        let count = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(too_large)?;
        let nbytes = count.checked_mul(element.size()).ok_or_else(too_large)?;
        if nbytes > isize::MAX as usize {
            return Err(too_large());
        }

        Ok(Self {
            dims: dims.to_vec(),
            strides: strides_for(dims, element.size(), layout),
            element,
            layout,
            data: vec![UNINIT_FILL; nbytes],
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Byte strides, one per dimension.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn layout(&self) -> ArrayLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.element.size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

fn strides_for(dims: &[usize], element_size: usize, layout: ArrayLayout) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut step = element_size;
    match layout {
        ArrayLayout::RowMajor => {
            for (stride, &dim) in strides.iter_mut().zip(dims).rev() {
                *stride = step;
                step = step.saturating_mul(dim);
            }
        }
        ArrayLayout::ColumnMajor => {
            for (stride, &dim) in strides.iter_mut().zip(dims) {
                *stride = step;
                step = step.saturating_mul(dim);
            }
        }
    }
    strides
}

/// Allocate an array and guarantee every byte of its buffer is zero.
pub fn create_zero_filled_array(
    dims: &[usize],
    element: ElementType,
    layout: ArrayLayout,
) -> Result<NdArray, ArrayError> {
    let mut array = NdArray::empty(dims, element, layout)?;
    array.as_bytes_mut().fill(0);
    Ok(array)
}
