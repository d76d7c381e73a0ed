mod shape;

use std::fmt::Display;

use bilge::prelude::*;
use serde::{Serialize, Serializer};

pub use shape::NameShape;

/// Width of every register word, in bits.
pub const REGISTER_BITS: u32 = 32;

// Blank descriptions are stored as absent ones
fn non_blank(description: Option<String>) -> Option<String> {
    description.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldError {
    BitOffset(u32),
    Width(u32),
    /// `bit_offset + width` runs past the register word
    Span { bit_offset: u32, width: u32 },
}

impl Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldError::BitOffset(bit_offset) => {
                write!(f, "bit offset {bit_offset} is outside of a {REGISTER_BITS}-bit word")
            }
            FieldError::Width(width) => {
                write!(f, "width {width} is not in 1..={REGISTER_BITS}")
            }
            FieldError::Span { bit_offset, width } => write!(
                f,
                "bits {}..={} do not fit in a {REGISTER_BITS}-bit word",
                bit_offset,
                bit_offset + width - 1
            ),
        }
    }
}

impl std::error::Error for FieldError {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename = "field")]
pub struct Field {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@bit_offset", serialize_with = "serialize_u5")]
    bit_offset: u5,
    #[serde(rename = "@width", serialize_with = "serialize_u6")]
    width: u6,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl Field {
    pub fn new(
        name: impl Into<String>,
        bit_offset: u32,
        width: u32,
        description: Option<String>,
    ) -> Result<Self, FieldError> {
        if bit_offset >= REGISTER_BITS {
            return Err(FieldError::BitOffset(bit_offset));
        }
        if width == 0 || width > REGISTER_BITS {
            return Err(FieldError::Width(width));
        }
        if bit_offset + width > REGISTER_BITS {
            return Err(FieldError::Span { bit_offset, width });
        }
        Ok(Self {
            name: name.into(),
            bit_offset: u5::new(bit_offset as u8),
            width: u6::new(width as u8),
            description: non_blank(description),
        })
    }

    /// Same bits and description under another name
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bit_offset(&self) -> u32 {
        self.bit_offset.value() as u32
    }

    pub fn width(&self) -> u32 {
        self.width.value() as u32
    }

    /// First bit after the field
    pub fn end(&self) -> u32 {
        self.bit_offset() + self.width()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.bit_offset() < other.end() && other.bit_offset() < self.end()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename = "register")]
pub struct Register {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@byte_offset")]
    byte_offset: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    // Sorted by their bit offset
    #[serde(rename = "field")]
    fields: Vec<Field>,
}

impl Register {
    pub fn new(name: impl Into<String>, byte_offset: u32, description: Option<String>) -> Self {
        Self {
            name: name.into(),
            byte_offset,
            description: non_blank(description),
            fields: Vec::new(),
        }
    }

    /// Inserts after any field with the same or a lower bit offset.
    pub fn add_field(&mut self, field: Field) {
        let at = self
            .fields
            .partition_point(|v| v.bit_offset() <= field.bit_offset());
        self.fields.insert(at, field);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn byte_offset(&self) -> u32 {
        self.byte_offset
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Exactly one field.
    pub fn is_collapsible(&self) -> bool {
        self.fields.len() == 1
    }

    /// No fields, or a single field covering the whole word.
    pub fn is_simple(&self) -> bool {
        match self.fields.as_slice() {
            [] => true,
            [field] => field.width() == REGISTER_BITS,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename = "peripheral")]
pub struct Peripheral {
    #[serde(rename = "@name")]
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    // Sorted by their byte offset
    #[serde(rename = "register")]
    registers: Vec<Register>,
}

impl Peripheral {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        Self {
            name: name.into(),
            description: non_blank(description),
            registers: Vec::new(),
        }
    }

    /// Inserts after any register with the same or a lower byte offset.
    pub fn add_register(&mut self, register: Register) {
        let at = self
            .registers
            .partition_point(|v| v.byte_offset() <= register.byte_offset());
        self.registers.insert(at, register);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// Checks the extracted model does not rely on.
    ///
    /// Nothing here stops generation, callers decide how loud to be about it.
    pub fn lint(&self) -> Vec<Lint> {
        let mut lints = Vec::new();
        for register in self.registers.iter() {
            let fields = register.fields();
            for (i, first) in fields.iter().enumerate() {
                // Sorted, so only later fields starting before `first` ends can collide
                for second in fields[i + 1..]
                    .iter()
                    .take_while(|v| first.overlaps(v))
                {
                    lints.push(Lint::OverlappingFields {
                        register: register.name.clone(),
                        first: first.name.clone(),
                        second: second.name.clone(),
                    });
                }
            }
        }
        for (i, register) in self.registers.iter().enumerate() {
            let Some(previous) = self.registers[..i]
                .iter()
                .find(|v| v.name == register.name)
            else {
                continue;
            };
            lints.push(Lint::DuplicateRegisterName {
                name: register.name.clone(),
                first_offset: previous.byte_offset,
                second_offset: register.byte_offset,
            });
        }
        lints
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lint {
    OverlappingFields {
        register: String,
        first: String,
        second: String,
    },
    DuplicateRegisterName {
        name: String,
        first_offset: u32,
        second_offset: u32,
    },
}

impl Display for Lint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lint::OverlappingFields {
                register,
                first,
                second,
            } => write!(f, "{register}: fields [{first}] and [{second}] overlap"),
            Lint::DuplicateRegisterName {
                name,
                first_offset,
                second_offset,
            } => write!(
                f,
                "register [{name}] is defined at {first_offset:#x} and again at {second_offset:#x}"
            ),
        }
    }
}

fn serialize_u5<S: Serializer>(value: &u5, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(value.value())
}

fn serialize_u6<S: Serializer>(value: &u6, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(value.value())
}
