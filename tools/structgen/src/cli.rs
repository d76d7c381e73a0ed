use clap::Parser;
use clio::{Input, OutputPath};

/// MMIO peripheral struct generator for ESP-IDF style register headers
#[derive(Parser, Debug)]
pub struct Args {
    /// Peripheral name, used for the `<name>_t` struct and as type prefix
    pub name: String,

    /// Register header (`*_reg.h`), `-` for stdin
    #[arg(value_parser, default_value = "-")]
    pub input: Input,

    /// Generated header, `-` for stdout
    #[arg(value_parser, default_value = "-")]
    pub output: OutputPath,

    /// Comment placed above the peripheral struct
    #[arg(long)]
    pub desc: Option<String>,

    /// Macro name prefix to match and strip, e.g. `UART_`
    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Warn about overlapping fields and duplicate register names
    #[arg(long, default_value_t = false)]
    pub lint: bool,

    /// Also write the extracted register model as XML
    #[arg(long, value_parser)]
    pub dump_model: Option<OutputPath>,
}
