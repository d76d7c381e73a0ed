use std::fmt::{Display, Formatter};

use regmodel::{Field, NameShape, Peripheral, Register, REGISTER_BITS};

const WORD_BYTES: u32 = REGISTER_BITS / 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayoutError {
    /// Register starts before the end of the previous declaration
    Overlap {
        register: String,
        offset: u32,
        expected: u64,
    },
    Misaligned { register: String, offset: u32 },
}

impl Display for LayoutError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutError::Overlap {
                register,
                offset,
                expected,
            } => write!(
                f,
                "register [{register}] at {offset:#x} overlaps the layout, expected an offset of at least {expected:#x}"
            ),
            LayoutError::Misaligned { register, offset } => write!(
                f,
                "register [{register}] at {offset:#x} is not aligned to {WORD_BYTES} bytes"
            ),
        }
    }
}

impl std::error::Error for LayoutError {}

/// One entry of the aggregate struct, in address order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Member<'a> {
    /// `volatile uint32_t _padding<index>[<words>];`
    Padding { index: usize, words: u32 },
    Register(&'a Register),
    /// Run of registers collapsed into `template[length]`
    Array { template: Register, length: usize },
}

/// Bit-accurate content of a register word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitSpan<'a> {
    Reserved(u32),
    Field(&'a Field),
}

impl BitSpan<'_> {
    pub fn width(&self) -> u32 {
        match self {
            BitSpan::Reserved(width) => *width,
            BitSpan::Field(field) => field.width(),
        }
    }
}

/// Fields in bit order with every gap, including the one up to the top bit,
/// filled by a reserved span.
pub fn bit_spans(register: &Register) -> Vec<BitSpan<'_>> {
    let mut spans = Vec::new();
    let mut bitpos = 0;
    for field in register.fields() {
        if field.bit_offset() > bitpos {
            spans.push(BitSpan::Reserved(field.bit_offset() - bitpos));
        }
        spans.push(BitSpan::Field(field));
        bitpos = bitpos.max(field.end());
    }
    if bitpos < REGISTER_BITS {
        spans.push(BitSpan::Reserved(REGISTER_BITS - bitpos));
    }
    spans
}

/// Planned C layout of a peripheral.
///
/// Displays as the auxiliary `typedef`s followed by the aggregate
/// `<peripheral>_t`.
pub struct PeripheralLayout<'a> {
    peripheral: &'a Peripheral,
    type_prefix: String,
    members: Vec<Member<'a>>,
}

impl<'a> PeripheralLayout<'a> {
    pub fn new(peripheral: &'a Peripheral) -> Result<Self, LayoutError> {
        Ok(Self {
            peripheral,
            type_prefix: format!("{}_", peripheral.name()),
            members: plan(peripheral.registers())?,
        })
    }

    pub fn members(&self) -> &[Member<'a>] {
        &self.members
    }

    pub fn types(&self) -> TypeDefinitions<'_> {
        TypeDefinitions(self)
    }

    pub fn body(&self) -> AggregateStruct<'_> {
        AggregateStruct(self)
    }
}

impl Display for PeripheralLayout<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.types(), self.body())
    }
}

pub struct TypeDefinitions<'a>(&'a PeripheralLayout<'a>);

impl Display for TypeDefinitions<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let layout = self.0;
        for member in layout.members.iter() {
            match member {
                Member::Padding { .. } => {}
                Member::Register(register) => {
                    write_type(f, register, &layout.type_prefix, false)?
                }
                Member::Array { template, .. } => {
                    write_type(f, template, &layout.type_prefix, true)?
                }
            }
        }
        Ok(())
    }
}

pub struct AggregateStruct<'a>(&'a PeripheralLayout<'a>);

impl Display for AggregateStruct<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let layout = self.0;
        if let Some(description) = layout.peripheral.description() {
            writeln!(f, "// {description}")?;
        }
        writeln!(f, "typedef struct {{")?;
        for member in layout.members.iter() {
            match member {
                Member::Padding { index, words } => {
                    writeln!(f, "    // Padding.")?;
                    writeln!(f, "    volatile uint32_t _padding{index}[{words}];")?;
                }
                Member::Register(register) => {
                    write_member(f, register, &layout.type_prefix, None)?
                }
                Member::Array { template, length } => {
                    write_member(f, template, &layout.type_prefix, Some(*length))?
                }
            }
        }
        writeln!(f, "}} {}_t;", layout.peripheral.name())?;
        writeln!(f)
    }
}

/// Generated header: provenance comment, `stdint.h` include, types and aggregate.
pub fn render_header(peripheral: &Peripheral, source: &str) -> Result<String, LayoutError> {
    let layout = PeripheralLayout::new(peripheral)?;
    Ok(format!(
        "\n// Generated from ESP-IDF: https://github.com/espressif/esp-idf\n// {source}\n\n#include <stdint.h>\n\n{layout}"
    ))
}

/// Walks `registers` in the given order, a register starting below the running
/// offset is an error even when sorting would have fixed it.
pub fn plan(registers: &[Register]) -> Result<Vec<Member<'_>>, LayoutError> {
    let mut members = Vec::new();
    let mut expected_offset: u64 = 0;
    let mut padding = 0;
    let mut i = 0;
    while i < registers.len() {
        let register = &registers[i];
        let offset = register.byte_offset();
        if offset % WORD_BYTES != 0 {
            return Err(LayoutError::Misaligned {
                register: register.name().to_owned(),
                offset,
            });
        }
        if (offset as u64) < expected_offset {
            return Err(LayoutError::Overlap {
                register: register.name().to_owned(),
                offset,
                expected: expected_offset,
            });
        }
        if (offset as u64) > expected_offset {
            let words = ((offset as u64 - expected_offset) / WORD_BYTES as u64) as u32;
            members.push(Member::Padding {
                index: padding,
                words,
            });
            padding += 1;
            expected_offset = offset as u64;
        }

        let length = run_length(&registers[i..]);
        if length > 1 {
            let template = array_template(register);
            log::info!(
                "[{}] at {:#x}: {} registers coalesced into [{}]",
                register.name(),
                offset,
                length,
                template.name()
            );
            members.push(Member::Array { template, length });
        } else {
            members.push(Member::Register(register));
        }
        expected_offset += (WORD_BYTES as usize * length) as u64;
        i += length;
    }
    Ok(members)
}

/// Registers from the start of `registers` that form one array, at least 1.
fn run_length(registers: &[Register]) -> usize {
    registers
        .windows(2)
        .take_while(|pair| array_compatible(&pair[0], &pair[1]))
        .count()
        + 1
}

/// `b` directly follows `a` as the next element of the same register array.
pub fn array_compatible(a: &Register, b: &Register) -> bool {
    if a.fields().len() != b.fields().len() {
        return false;
    }
    let fields_match = a.fields().iter().zip(b.fields()).all(|(fa, fb)| {
        let (Some(sa), Some(sb)) = (NameShape::parse(fa.name()), NameShape::parse(fb.name()))
        else {
            return false;
        };
        sa.same_family(&sb) && fa.bit_offset() == fb.bit_offset() && fa.width() == fb.width()
    });
    if !fields_match {
        return false;
    }

    let (Some(sa), Some(sb)) = (NameShape::parse(a.name()), NameShape::parse(b.name())) else {
        return false;
    };
    let (Some(ia), Some(ib)) = (sa.index, sb.index) else {
        return false;
    };
    let Some(stride) = b.byte_offset().checked_sub(a.byte_offset()) else {
        return false;
    };
    if stride == 0 || stride % WORD_BYTES != 0 {
        return false;
    }
    ib.checked_sub(ia) == Some(stride / WORD_BYTES) && sa.same_family(&sb)
}

/// Index-free copy of the first register of an array.
///
/// Fields carrying the register's own index marker (`ch0_en` in `ch0_ctrl`)
/// lose the whole family prefix and become `en`.
fn array_template(first: &Register) -> Register {
    let Some(shape) = NameShape::parse(first.name()) else {
        return first.clone();
    };
    let mut template = Register::new(
        shape.stripped(),
        first.byte_offset(),
        first.description().map(str::to_owned),
    );
    for field in first.fields() {
        let name = match NameShape::parse(field.name()) {
            Some(v) if v.prefix == shape.prefix && v.index == shape.index => {
                match v.suffix.trim_start_matches('_') {
                    "" => v.stripped(),
                    suffix => suffix.to_owned(),
                }
            }
            Some(v) => v.stripped(),
            None => field.name().to_owned(),
        };
        template.add_field(field.renamed(name));
    }
    template
}

fn write_type(
    f: &mut Formatter<'_>,
    register: &Register,
    type_prefix: &str,
    in_array: bool,
) -> std::fmt::Result {
    if register.is_simple() || (register.is_collapsible() && !in_array) {
        return Ok(());
    }
    if let Some(description) = register.description() {
        writeln!(f, "// {description}")?;
    }
    writeln!(f, "typedef volatile struct {{")?;
    write_fields(f, register, "    ", "")?;
    writeln!(f, "}} {type_prefix}{}_t;", register.name())?;
    writeln!(f)
}

fn write_member(
    f: &mut Formatter<'_>,
    register: &Register,
    type_prefix: &str,
    length: Option<usize>,
) -> std::fmt::Result {
    let name = register.name();
    let dimension = match length {
        Some(length) => format!("[{length}]"),
        None => String::new(),
    };
    if register.is_simple() {
        if let Some(description) = register.fields().first().and_then(|v| v.description()) {
            writeln!(f, "    // {description}")?;
        }
        return writeln!(f, "    volatile uint32_t {name}{dimension};");
    }
    if let Some(description) = register.description() {
        writeln!(f, "    // {description}")?;
    }
    if register.is_collapsible() && length.is_none() {
        writeln!(f, "    volatile struct {{")?;
        write_fields(f, register, "        ", &format!("{name}_"))?;
        writeln!(f, "    }};")
    } else {
        writeln!(f, "    {type_prefix}{name}_t {name}{dimension};")
    }
}

fn write_fields(
    f: &mut Formatter<'_>,
    register: &Register,
    indent: &str,
    name_prefix: &str,
) -> std::fmt::Result {
    for span in bit_spans(register) {
        match span {
            BitSpan::Reserved(width) => writeln!(f, "{indent}uint32_t : {width};")?,
            BitSpan::Field(field) => {
                if let Some(description) = field.description() {
                    writeln!(f, "{indent}// {description}")?;
                }
                writeln!(
                    f,
                    "{indent}uint32_t {name_prefix}{} : {};",
                    field.name(),
                    field.width()
                )?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_HEADER: &str = "\n\n#define DEV_CH0_CONF_REG          (DR_REG_DEV_BASE + 0x10)
/* DEV_CH0_MODE : R/W ;bitpos:[5:4] ;default: 2'b0 ; */
/*description: Channel 0 mode.*/
#define DEV_CH0_MODE  0x00000003
/* DEV_CH0_EN : R/W ;bitpos:[0] ;default: 1'b0 ; */
/*description: Channel 0 enable.*/
#define DEV_CH0_EN  (BIT(0))

#define DEV_CH1_CONF_REG          (DR_REG_DEV_BASE + 0x14)
/* DEV_CH1_MODE : R/W ;bitpos:[5:4] ;default: 2'b0 ; */
/*description: Channel 1 mode.*/
#define DEV_CH1_MODE  0x00000003
/* DEV_CH1_EN : R/W ;bitpos:[0] ;default: 1'b0 ; */
/*description: Channel 1 enable.*/
#define DEV_CH1_EN  (BIT(0))

/** Version register */
#define DEV_DATE_REG          (DR_REG_DEV_BASE + 0xFC)
/* DEV_DATE : R/W ;bitpos:[27:0] ;default: 28'h2101 ; */
/*description: Version control.*/
#define DEV_DATE  0x0FFFFFFF
";

    fn field(name: &str, bit_offset: u32, width: u32) -> Field {
        Field::new(name, bit_offset, width, None).unwrap()
    }

    fn register(name: &str, offset: u32, fields: &[(&str, u32, u32)]) -> Register {
        let mut register = Register::new(name, offset, None);
        for (name, bit_offset, width) in fields {
            register.add_field(field(name, *bit_offset, *width));
        }
        register
    }

    fn peripheral(registers: Vec<Register>) -> Peripheral {
        let mut peripheral = Peripheral::new("dev", None);
        for register in registers {
            peripheral.add_register(register);
        }
        peripheral
    }

    fn channels() -> Peripheral {
        peripheral(vec![
            register("ch0_ctrl", 0x10, &[("ch0_en", 0, 1)]),
            register("ch1_ctrl", 0x14, &[("ch1_en", 0, 1)]),
            register("ch2_ctrl", 0x18, &[("ch2_en", 0, 1)]),
        ])
    }

    #[test]
    fn padding_fills_gaps() {
        let peripheral = peripheral(vec![
            register("a", 0x0, &[]),
            register("b", 0x10, &[]),
            register("c", 0x14, &[]),
            register("d", 0x40, &[]),
        ]);
        let layout = PeripheralLayout::new(&peripheral).unwrap();
        let regs = peripheral.registers();
        assert_eq!(
            layout.members(),
            [
                Member::Register(&regs[0]),
                Member::Padding { index: 0, words: 3 },
                Member::Register(&regs[1]),
                Member::Register(&regs[2]),
                Member::Padding {
                    index: 1,
                    words: 10
                },
                Member::Register(&regs[3]),
            ]
        );
    }

    #[test]
    fn leading_padding() {
        let peripheral = peripheral(vec![register("a", 0x8, &[])]);
        let text = PeripheralLayout::new(&peripheral).unwrap().to_string();
        assert_eq!(
            text,
            "typedef struct {
    // Padding.
    volatile uint32_t _padding0[2];
    volatile uint32_t a;
} dev_t;

"
        );
    }

    #[test]
    fn bit_coverage() {
        let cases = [
            register("a", 0, &[("x", 0, 1)]),
            register("b", 0, &[("x", 31, 1)]),
            register("c", 0, &[("x", 3, 4), ("y", 12, 8), ("z", 30, 2)]),
            register("d", 0, &[("x", 0, 16), ("y", 16, 16)]),
            register("e", 0, &[("x", 5, 20)]),
        ];
        for register in cases.iter() {
            let total: u32 = bit_spans(register).iter().map(|v| v.width()).sum();
            assert_eq!(total, REGISTER_BITS, "{}", register.name());
        }
        assert_eq!(
            bit_spans(&cases[2]),
            [
                BitSpan::Reserved(3),
                BitSpan::Field(&cases[2].fields()[0]),
                BitSpan::Reserved(5),
                BitSpan::Field(&cases[2].fields()[1]),
                BitSpan::Reserved(10),
                BitSpan::Field(&cases[2].fields()[2]),
            ]
        );
    }

    #[test]
    fn coalesces_channel_family() {
        let peripheral = channels();
        let layout = PeripheralLayout::new(&peripheral).unwrap();
        assert_eq!(layout.members().len(), 2);
        let Member::Array { template, length } = &layout.members()[1] else {
            panic!("expected an array, got {:?}", layout.members()[1]);
        };
        assert_eq!(*length, 3);
        assert_eq!(template.name(), "ch_ctrl");
        assert_eq!(template.fields()[0].name(), "en");

        assert_eq!(
            layout.to_string(),
            "typedef volatile struct {
    uint32_t en : 1;
    uint32_t : 31;
} dev_ch_ctrl_t;

typedef struct {
    // Padding.
    volatile uint32_t _padding0[4];
    dev_ch_ctrl_t ch_ctrl[3];
} dev_t;

"
        );
    }

    #[test]
    fn layout_mismatch_prevents_coalescing() {
        let peripheral = peripheral(vec![
            register("ch0_ctrl", 0x0, &[("ch0_en", 0, 1)]),
            register("ch1_ctrl", 0x4, &[("ch1_en", 1, 1)]),
        ]);
        let layout = PeripheralLayout::new(&peripheral).unwrap();
        assert!(layout
            .members()
            .iter()
            .all(|v| matches!(v, Member::Register(_))));
        assert_eq!(layout.members().len(), 2);

        let peripheral = self::peripheral(vec![
            register("ch0_ctrl", 0x0, &[("ch0_en", 0, 1)]),
            register("ch1_ctrl", 0x4, &[("ch1_en", 0, 1), ("ch1_mode", 1, 2)]),
        ]);
        let layout = PeripheralLayout::new(&peripheral).unwrap();
        assert_eq!(layout.members().len(), 2);
        assert!(matches!(layout.members()[0], Member::Register(_)));
    }

    #[test]
    fn index_must_follow_stride() {
        // Index advances by 1, address by 2 words
        let a = register("ch0_ctrl", 0x0, &[]);
        let b = register("ch1_ctrl", 0x8, &[]);
        assert!(!array_compatible(&a, &b));
        let b = register("ch2_ctrl", 0x8, &[]);
        assert!(array_compatible(&a, &b));
        let b = register("ch1_conf", 0x4, &[]);
        assert!(!array_compatible(&a, &b));
        let b = register("ch1_ctrl", 0x0, &[]);
        assert!(!array_compatible(&a, &b));
        let plain = register("ctrl", 0x4, &[]);
        assert!(!array_compatible(&plain, &register("ctrl", 0x8, &[])));
    }

    #[test]
    fn greedy_run_stops_at_first_break() {
        let peripheral = peripheral(vec![
            register("tx0_data", 0x0, &[]),
            register("tx1_data", 0x4, &[]),
            register("tx2_data", 0x8, &[]),
            register("rx0_data", 0xc, &[]),
            register("rx1_data", 0x10, &[]),
            register("status", 0x14, &[]),
        ]);
        let text = PeripheralLayout::new(&peripheral).unwrap().to_string();
        assert_eq!(
            text,
            "typedef struct {
    volatile uint32_t tx_data[3];
    volatile uint32_t rx_data[2];
    volatile uint32_t status;
} dev_t;

"
        );
    }

    #[test]
    fn simple_registers_are_scalars() {
        let mut full = Register::new("value", 0x4, Some("Current value".into()));
        full.add_field(Field::new("value", 0, 32, Some("Counter value".into())).unwrap());
        let peripheral = peripheral(vec![register("date", 0x0, &[]), full]);
        let layout = PeripheralLayout::new(&peripheral).unwrap();
        assert_eq!(layout.types().to_string(), "");
        assert_eq!(
            layout.body().to_string(),
            "typedef struct {
    volatile uint32_t date;
    // Counter value
    volatile uint32_t value;
} dev_t;

"
        );
    }

    #[test]
    fn collapsible_register_is_inlined() {
        let mut conf = Register::new("conf", 0x0, Some("Clock configuration".into()));
        conf.add_field(Field::new("div", 4, 8, Some("Divider".into())).unwrap());
        let mut peripheral = Peripheral::new("clk", Some("Clock controller".into()));
        peripheral.add_register(conf);
        let layout = PeripheralLayout::new(&peripheral).unwrap();
        assert_eq!(layout.types().to_string(), "");
        assert_eq!(
            layout.body().to_string(),
            "// Clock controller
typedef struct {
    // Clock configuration
    volatile struct {
        uint32_t : 4;
        // Divider
        uint32_t conf_div : 8;
        uint32_t : 20;
    };
} clk_t;

"
        );
    }

    #[test]
    fn multi_field_register_gets_named_type() {
        let peripheral = peripheral(vec![register(
            "ctrl",
            0x0,
            &[("en", 0, 1), ("mode", 4, 2)],
        )]);
        assert_eq!(
            PeripheralLayout::new(&peripheral).unwrap().to_string(),
            "typedef volatile struct {
    uint32_t en : 1;
    uint32_t : 3;
    uint32_t mode : 2;
    uint32_t : 26;
} dev_ctrl_t;

typedef struct {
    dev_ctrl_t ctrl;
} dev_t;

"
        );
    }

    #[test]
    fn overlapping_offsets_are_fatal() {
        let mut peripheral = Peripheral::new("dev", None);
        peripheral.add_register(register("a", 0x10, &[]));
        peripheral.add_register(register("b", 0x10, &[]));
        assert_eq!(
            PeripheralLayout::new(&peripheral).err(),
            Some(LayoutError::Overlap {
                register: "b".into(),
                offset: 0x10,
                expected: 0x14,
            })
        );
        assert!(render_header(&peripheral, "in.h").is_err());
    }

    #[test]
    fn out_of_order_sequence_is_fatal() {
        let registers = [register("a", 0x10, &[]), register("b", 0x8, &[])];
        assert_eq!(
            plan(&registers),
            Err(LayoutError::Overlap {
                register: "b".into(),
                offset: 0x8,
                expected: 0x14,
            })
        );
    }

    #[test]
    fn misaligned_offset_is_fatal() {
        let peripheral = peripheral(vec![register("a", 0x0, &[]), register("b", 0x6, &[])]);
        assert_eq!(
            PeripheralLayout::new(&peripheral).err(),
            Some(LayoutError::Misaligned {
                register: "b".into(),
                offset: 0x6,
            })
        );
    }

    #[test]
    fn header_is_reproducible() {
        let render = || {
            let peripheral = regmodel_from_esp_header::parse(DEV_HEADER, "dev", None, "DEV_");
            render_header(&peripheral, "soc/dev_reg.h").unwrap()
        };
        let first = render();
        assert_eq!(first, render());
        assert!(first.starts_with(
            "\n// Generated from ESP-IDF: https://github.com/espressif/esp-idf\n// soc/dev_reg.h\n\n#include <stdint.h>\n\ntypedef volatile struct {\n"
        ));
    }

    #[test]
    fn blank_descriptions_are_not_rendered() {
        let text = "\n\n#define DEV_CONF_REG (DR_REG_DEV_BASE + 0x0)
/* DEV_A : R/W ;bitpos:[0] ;default: 1'b0 ; */
/*description: .*/
#define DEV_A (BIT(0))
";
        let peripheral = regmodel_from_esp_header::parse(text, "dev", Some(""), "DEV_");
        let text = PeripheralLayout::new(&peripheral).unwrap().to_string();
        assert_eq!(
            text,
            "typedef struct {
    volatile struct {
        uint32_t conf_a : 1;
        uint32_t : 31;
    };
} dev_t;

"
        );
    }

    #[test]
    fn header_text_end_to_end() {
        let peripheral = regmodel_from_esp_header::parse(DEV_HEADER, "dev", None, "DEV_");
        let layout = PeripheralLayout::new(&peripheral).unwrap();
        assert_eq!(
            layout.to_string(),
            "typedef volatile struct {
    // Channel 0 enable
    uint32_t en : 1;
    uint32_t : 3;
    // Channel 0 mode
    uint32_t mode : 2;
    uint32_t : 26;
} dev_ch_conf_t;

typedef struct {
    // Padding.
    volatile uint32_t _padding0[4];
    dev_ch_conf_t ch_conf[2];
    // Padding.
    volatile uint32_t _padding1[57];
    // Version register
    volatile struct {
        // Version control
        uint32_t date_date : 28;
        uint32_t : 4;
    };
} dev_t;

"
        );
    }
}
