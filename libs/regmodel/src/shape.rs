use nom::{
    bytes::complete::take_while1,
    character::complete::digit1,
    combinator::{opt, rest},
    IResult,
};

/// Identifier split around its first decimal run.
///
/// `ch12_ctrl` becomes `("ch", Some(12), "_ctrl")`, `enable` becomes
/// `("enable", None, "")`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NameShape<'a> {
    pub prefix: &'a str,
    pub index: Option<u32>,
    pub suffix: &'a str,
}

impl<'a> NameShape<'a> {
    /// Returns `None` when the name does not start with a letter or underscore,
    /// or when its digit run does not fit in a `u32`.
    pub fn parse(name: &'a str) -> Option<Self> {
        let (_, (prefix, digits, suffix)) = shape(name).ok()?;
        let index = digits.map(str::parse::<u32>).transpose().ok()?;
        Some(Self {
            prefix,
            index,
            suffix,
        })
    }

    /// Name with the index run removed.
    pub fn stripped(&self) -> String {
        format!("{}{}", self.prefix, self.suffix)
    }

    /// Same text around the index run, whatever the index is.
    pub fn same_family(&self, other: &Self) -> bool {
        self.prefix == other.prefix && self.suffix == other.suffix
    }
}

fn shape(input: &str) -> IResult<&str, (&str, Option<&str>, &str)> {
    let (input, prefix) = take_while1(|c: char| c.is_ascii_alphabetic() || c == '_')(input)?;
    let (input, digits) = opt(digit1)(input)?;
    let (input, suffix) = rest(input)?;
    Ok((input, (prefix, digits, suffix)))
}
