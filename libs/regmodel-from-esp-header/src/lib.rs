use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{
        char, digit1, hex_digit1, multispace0, multispace1, not_line_ending, satisfy,
    },
    combinator::{map_res, opt, peek, verify},
    multi::many0_count,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use nom_locate::LocatedSpan;
use regmodel::{Field, Peripheral, Register};

type Span<'a> = LocatedSpan<&'a str>;

/// Register as written in the header, before any validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRegister {
    pub name: String,
    pub offset: u32,
    pub description: Option<String>,
    /// Line of the address `#define`
    pub line: u32,
    pub fields: Vec<RawField>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawField {
    pub name: String,
    pub bitpos: BitPos,
    /// `None` when the description comment is empty
    pub description: Option<String>,
    pub line: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitPos {
    /// `bitpos:[hi:lo]`
    Range { hi: u32, lo: u32 },
    /// `bitpos:[n]`
    Single(u32),
}

impl BitPos {
    /// `(bit_offset, width)`, `None` for an inverted range
    pub fn offset_and_width(&self) -> Option<(u32, u32)> {
        match *self {
            BitPos::Range { hi, lo } if lo <= hi => Some((lo, (hi - lo).checked_add(1)?)),
            BitPos::Range { .. } => None,
            BitPos::Single(bit) => Some((bit, 1)),
        }
    }
}

impl RawRegister {
    /// Fields with unusable bit positions are dropped with a warning.
    pub fn into_register(self) -> Register {
        let mut register = Register::new(self.name, self.offset, self.description);
        for field in self.fields {
            let Some((bit_offset, width)) = field.bitpos.offset_and_width() else {
                log::warn!(
                    "line {}: skipping field [{}], inverted bit range {:?}",
                    field.line,
                    field.name,
                    field.bitpos
                );
                continue;
            };
            match Field::new(field.name, bit_offset, width, field.description) {
                Ok(v) => register.add_field(v),
                Err(e) => {
                    log::warn!("line {}: skipping field of [{}]: {e}", field.line, register.name())
                }
            }
        }
        register
    }
}

/// Extracts and models a whole header.
///
/// `prefix` must literally start every register and field macro name and is
/// stripped from the stored names, pass `""` to keep names as they are.
pub fn parse(input: &str, name: &str, description: Option<&str>, prefix: &str) -> Peripheral {
    let mut peripheral = Peripheral::new(name, description.map(str::to_owned));
    for raw in extract(input, prefix) {
        log::debug!(
            "line {}: register [{}] at {:#x} with {} field(s)",
            raw.line,
            raw.name,
            raw.offset,
            raw.fields.len()
        );
        peripheral.add_register(raw.into_register());
    }
    peripheral
}

/// Scans blank-line separated blocks for register definitions, in source order.
///
/// Blocks that do not start with a register address macro (optionally after a
/// comment) are skipped, this never fails.
pub fn extract(input: &str, prefix: &str) -> Vec<RawRegister> {
    let text = input.replace("\r\n", "\n").replace('\r', "\n");
    let mut rest = Span::new(&text);
    let mut registers = Vec::new();

    while let Ok((after, _)) = block_boundary(rest) {
        rest = after;

        let description = match block_comment(rest) {
            Ok((after, body)) => {
                rest = after;
                clean_block_comment(body.fragment())
            }
            Err(_) => None,
        };

        let Ok((after, address)) = register_address(rest, prefix) else {
            continue;
        };
        rest = after;

        let mut register = RawRegister {
            name: address.name,
            offset: address.offset,
            description,
            line: address.line,
            fields: Vec::new(),
        };
        while let Ok((after, comment)) = field_comment(rest, prefix) {
            rest = after;
            let Ok((after, description)) = field_description(rest) else {
                // Bit position without its description comment ends the register
                break;
            };
            rest = after;
            register.fields.push(RawField {
                name: comment.name,
                bitpos: comment.bitpos,
                description,
                line: comment.line,
            });
            rest = skip_defines(rest);
        }
        registers.push(register);
    }
    registers
}

struct RegisterAddress {
    name: String,
    offset: u32,
    line: u32,
}

struct FieldComment {
    name: String,
    bitpos: BitPos,
    line: u32,
}

fn block_boundary(input: Span) -> IResult<Span, Span> {
    preceded(take_until("\n\n"), tag("\n\n"))(input)
}

fn block_comment(input: Span) -> IResult<Span, Span> {
    let (input, _) = opt(char('\n'))(input)?;
    let (input, _) = pair(char('/'), take_while1(|c: char| c == '*'))(input)?;
    let (input, body) = take_until("*/")(input)?;
    let (input, _) = pair(tag("*/"), line_end)(input)?;
    Ok((input, body))
}

// #define <PREFIX><NAME>[_REG] (<IDENT>_BASE + 0x..)
// #define <PREFIX><NAME>[_REG](i) (<IDENT>_BASE(i) + 0x..)
fn register_address<'a>(input: Span<'a>, prefix: &str) -> IResult<Span<'a>, RegisterAddress> {
    let (input, _) = opt(char('\n'))(input)?;
    let line = input.location_line();
    let (input, _) = tag("#define ")(input)?;
    let (input, _) = tag(prefix)(input)?;
    let (input, (name, offset)) = alt((plain_address, indexed_address))(input)?;
    Ok((
        input,
        RegisterAddress {
            name: register_name(name.fragment()),
            offset,
            line,
        },
    ))
}

fn plain_address(input: Span) -> IResult<Span, (Span, u32)> {
    let (input, name) = identifier(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = char('(')(input)?;
    let (input, _) = base_name(input)?;
    let (input, offset) = offset_term(input)?;
    let (input, _) = pair(char(')'), line_end)(input)?;
    Ok((input, (name, offset)))
}

fn indexed_address(input: Span) -> IResult<Span, (Span, u32)> {
    let (input, name) = identifier(input)?;
    let (input, _) = index_argument(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = char('(')(input)?;
    let (input, _) = base_name(input)?;
    let (input, _) = index_argument(input)?;
    let (input, offset) = offset_term(input)?;
    let (input, _) = pair(char(')'), line_end)(input)?;
    Ok((input, (name, offset)))
}

fn index_argument(input: Span) -> IResult<Span, Span> {
    delimited(char('('), identifier, char(')'))(input)
}

fn base_name(input: Span) -> IResult<Span, Span> {
    verify(identifier, |v: &Span| {
        v.fragment().len() > "_BASE".len() && v.fragment().ends_with("_BASE")
    })(input)
}

fn offset_term(input: Span) -> IResult<Span, u32> {
    let (input, _) = tuple((multispace0, char('+'), multispace0))(input)?;
    hex_u32(input)
}

// /* <PREFIX><NAME> : R/W ;bitpos:[hi:lo] ;default: 1'b0 ; */
fn field_comment<'a>(input: Span<'a>, prefix: &str) -> IResult<Span<'a>, FieldComment> {
    let (input, _) = opt(char('\n'))(input)?;
    let line = input.location_line();
    let (input, _) = tag("/* ")(input)?;
    let (input, _) = tag(prefix)(input)?;
    let (input, name) = identifier(input)?;
    let (input, _) = same_line(take_until("bitpos:["))(input)?;
    let (input, bitpos) = delimited(tag("bitpos:["), bit_position, char(']'))(input)?;
    let (input, _) = same_line(take_until("*/"))(input)?;
    let (input, _) = pair(tag("*/"), line_end)(input)?;
    Ok((
        input,
        FieldComment {
            name: name.fragment().to_lowercase(),
            bitpos,
            line,
        },
    ))
}

// /*description: Some text, possibly
// spanning lines.*/
fn field_description(input: Span) -> IResult<Span, Option<String>> {
    let (input, _) = opt(char('\n'))(input)?;
    let (input, _) = tag("/*")(input)?;
    let (input, _) = opt(tag("description:"))(input)?;
    let (input, _) = opt(char(' '))(input)?;
    let (input, text) = take_until("*/")(input)?;
    let (input, _) = pair(tag("*/"), line_end)(input)?;
    Ok((input, clean_field_description(text.fragment())))
}

fn bit_position(input: Span) -> IResult<Span, BitPos> {
    let (input, first) = dec_u32(input)?;
    let (input, second) = opt(preceded(char(':'), dec_u32))(input)?;
    let bitpos = match second {
        Some(lo) => BitPos::Range { hi: first, lo },
        None => BitPos::Single(first),
    };
    Ok((input, bitpos))
}

// Mask/shift companions of a field
fn define_line(input: Span) -> IResult<Span, Span> {
    let (input, _) = opt(char('\n'))(input)?;
    let (input, _) = tag("#define")(input)?;
    let (input, _) = satisfy(|c| c == ' ' || c == '\t')(input)?;
    verify(not_line_ending, |v: &Span| !v.fragment().is_empty())(input)
}

fn skip_defines(input: Span) -> Span {
    match many0_count(define_line)(input) {
        Ok((rest, _)) => rest,
        Err(_) => input,
    }
}

fn same_line<'a>(
    parser: impl FnMut(Span<'a>) -> IResult<Span<'a>, Span<'a>>,
) -> impl FnMut(Span<'a>) -> IResult<Span<'a>, Span<'a>> {
    verify(parser, |v: &Span<'a>| {
        !v.fragment().is_empty() && !v.fragment().contains('\n')
    })
}

// Left in place so the next parser (or the block boundary) still sees it
fn line_end(input: Span) -> IResult<Span, char> {
    peek(char('\n'))(input)
}

fn identifier(input: Span) -> IResult<Span, Span> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn hex_u32(input: Span) -> IResult<Span, u32> {
    preceded(
        tag("0x"),
        map_res(hex_digit1, |v: Span| u32::from_str_radix(v.fragment(), 16)),
    )(input)
}

fn dec_u32(input: Span) -> IResult<Span, u32> {
    map_res(digit1, |v: Span| v.fragment().parse::<u32>())(input)
}

fn register_name(name: &str) -> String {
    let name = match name.strip_suffix("_REG") {
        Some(stem) if !stem.is_empty() => stem,
        _ => name,
    };
    name.to_lowercase()
}

fn clean_block_comment(body: &str) -> Option<String> {
    let lines: Vec<_> = body
        .lines()
        .map(|v| v.trim().trim_start_matches('*').trim())
        .filter(|v| !v.is_empty())
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join(" "))
    }
}

fn clean_field_description(text: &str) -> Option<String> {
    let text = text.replace('\n', "");
    let text = text.trim_end();
    let text = text.strip_suffix('.').unwrap_or(text).trim();
    (!text.is_empty()).then(|| text.to_owned())
}
