//! Shapes, layouts and memory spaces.

use std::fmt;

/// Element type of an array shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    /// Boolean.
    Pred,
    /// 8-bit signed integer.
    S8,
    /// 32-bit signed integer.
    S32,
    /// 64-bit signed integer.
    S64,
    /// 8-bit unsigned integer.
    U8,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit unsigned integer.
    U64,
    /// 16-bit float.
    F16,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl PrimitiveType {
    /// Size of one element in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            PrimitiveType::Pred | PrimitiveType::S8 | PrimitiveType::U8 => 1,
            PrimitiveType::F16 => 2,
            PrimitiveType::S32 | PrimitiveType::U32 | PrimitiveType::F32 => 4,
            PrimitiveType::S64 | PrimitiveType::U64 | PrimitiveType::F64 => 8,
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimitiveType::Pred => "pred",
            PrimitiveType::S8 => "s8",
            PrimitiveType::S32 => "s32",
            PrimitiveType::S64 => "s64",
            PrimitiveType::U8 => "u8",
            PrimitiveType::U32 => "u32",
            PrimitiveType::U64 => "u64",
            PrimitiveType::F16 => "f16",
            PrimitiveType::F32 => "f32",
            PrimitiveType::F64 => "f64",
        };
        write!(f, "{}", name)
    }
}

/// Memory space tag ("color") attached to a resolved layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemorySpace(pub i64);

impl MemorySpace {
    /// Device-resident memory.
    pub const DEFAULT: MemorySpace = MemorySpace(0);

    /// Raw color value.
    pub fn color(&self) -> i64 {
        self.0
    }
}

impl Default for MemorySpace {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S({})", self.0)
    }
}

/// Resolved physical layout of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    /// Dimension order, most minor first.
    pub minor_to_major: Vec<usize>,
    /// Memory space the array lives in.
    pub memory_space: MemorySpace,
}

impl Layout {
    /// Row-major layout for an array of `rank` dimensions in device memory.
    pub fn row_major(rank: usize) -> Self {
        Self {
            minor_to_major: (0..rank).rev().collect(),
            memory_space: MemorySpace::DEFAULT,
        }
    }

    /// Returns this layout placed in `space`.
    #[must_use]
    pub fn with_memory_space(mut self, space: MemorySpace) -> Self {
        self.memory_space = space;
        self
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.minor_to_major.iter().map(|d| d.to_string()).collect();
        write!(f, "{{{}", dims.join(","))?;
        if self.memory_space != MemorySpace::DEFAULT {
            write!(f, ":{}", self.memory_space)?;
        }
        write!(f, "}}")
    }
}

/// Shape of an instruction result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    /// Dense array, optionally with a resolved layout.
    Array {
        /// Element type.
        element_type: PrimitiveType,
        /// Dimension sizes.
        dims: Vec<i64>,
        /// Resolved layout, if layout assignment has run.
        layout: Option<Layout>,
    },
    /// Tuple of shapes.
    Tuple(Vec<Shape>),
}

impl Shape {
    /// Array shape without a layout.
    pub fn array(element_type: PrimitiveType, dims: impl Into<Vec<i64>>) -> Self {
        Shape::Array {
            element_type,
            dims: dims.into(),
            layout: None,
        }
    }

    /// Rank-0 array with a default layout.
    pub fn scalar(element_type: PrimitiveType) -> Self {
        Shape::array(element_type, Vec::new()).with_default_layout()
    }

    /// Tuple shape.
    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple(elements)
    }

    /// Assigns a row-major layout in device memory to every array.
    #[must_use]
    pub fn with_default_layout(self) -> Self {
        match self {
            Shape::Array {
                element_type, dims, ..
            } => {
                let layout = Layout::row_major(dims.len());
                Shape::Array {
                    element_type,
                    dims,
                    layout: Some(layout),
                }
            }
            Shape::Tuple(elements) => Shape::Tuple(
                elements
                    .into_iter()
                    .map(Shape::with_default_layout)
                    .collect(),
            ),
        }
    }

    /// Assigns a row-major layout in `space`. Tuples are left unchanged.
    #[must_use]
    pub fn in_memory_space(self, space: MemorySpace) -> Self {
        match self {
            Shape::Array {
                element_type, dims, ..
            } => {
                let layout = Layout::row_major(dims.len()).with_memory_space(space);
                Shape::Array {
                    element_type,
                    dims,
                    layout: Some(layout),
                }
            }
            tuple => tuple,
        }
    }

    /// True if every array in the shape has a resolved layout.
    pub fn has_layout(&self) -> bool {
        match self {
            Shape::Array { layout, .. } => layout.is_some(),
            Shape::Tuple(elements) => elements.iter().all(Shape::has_layout),
        }
    }

    /// Resolved layout of an array shape.
    pub fn layout(&self) -> Option<&Layout> {
        match self {
            Shape::Array { layout, .. } => layout.as_ref(),
            Shape::Tuple(_) => None,
        }
    }

    /// Memory space of an array shape with a resolved layout.
    pub fn memory_space(&self) -> Option<MemorySpace> {
        self.layout().map(|l| l.memory_space)
    }

    /// True for tuple shapes.
    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    /// Element `index` of a tuple shape.
    pub fn tuple_element(&self, index: usize) -> Option<&Shape> {
        match self {
            Shape::Tuple(elements) => elements.get(index),
            Shape::Array { .. } => None,
        }
    }

    /// Number of elements in an array shape. Tuples have none.
    pub fn element_count(&self) -> usize {
        match self {
            Shape::Array { dims, .. } => dims.iter().map(|&d| d.max(0) as usize).product(),
            Shape::Tuple(_) => 0,
        }
    }

    /// Size in bytes of the array data, summed over tuple elements.
    pub fn byte_size(&self) -> usize {
        match self {
            Shape::Array { element_type, .. } => self.element_count() * element_type.byte_size(),
            Shape::Tuple(elements) => elements.iter().map(Shape::byte_size).sum(),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array {
                element_type,
                dims,
                layout,
            } => {
                let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "{}[{}]", element_type, dims.join(","))?;
                if let Some(layout) = layout {
                    write!(f, "{}", layout)?;
                }
                Ok(())
            }
            Shape::Tuple(elements) => {
                write!(f, "(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, ")")
            }
        }
    }
}
