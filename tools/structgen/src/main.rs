use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use cli::Args;
use clio::OutputPath;
use regmodel::Peripheral;

mod cli;

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        // Output may go to stdout, keep the default chatter on stderr to warnings
        env_logger::Env::default().default_filter_or("warn"),
    )
    .init();

    let mut args = Args::parse();

    let mut text = String::new();
    if let Err(e) = args.input.read_to_string(&mut text) {
        log::error!("Cannot read {}: {e}", args.input.path());
        return ExitCode::FAILURE;
    }
    let source = args.input.path().to_string();

    let peripheral =
        regmodel_from_esp_header::parse(&text, &args.name, args.desc.as_deref(), &args.prefix);
    log::info!(
        "{} register(s) extracted from {source}",
        peripheral.registers().len()
    );

    if args.lint {
        for lint in peripheral.lint() {
            log::warn!("{lint}");
        }
    }

    if let Some(path) = args.dump_model {
        if let Err(e) = dump_model(&peripheral, path) {
            log::error!("Cannot dump the register model: {e}");
            return ExitCode::FAILURE;
        }
    }

    // Nothing is created at the output path unless generation succeeded
    let header = match regmodel_to_c_struct::render_header(&peripheral, &source) {
        Ok(header) => header,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = write_output(args.output, &header) {
        log::error!("Cannot write the generated header: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn dump_model(
    peripheral: &Peripheral,
    path: OutputPath,
) -> Result<(), Box<dyn std::error::Error>> {
    let xml = quick_xml::se::to_string(peripheral)?;
    write_output(path, &xml)
}

fn write_output(path: OutputPath, content: &str) -> Result<(), Box<dyn std::error::Error>> {
    let target = path.path().is_local().then(|| path.path().to_path_buf());
    let mut output = path.create()?;
    write_all_or_discard(&mut output, target.as_deref(), content)?;
    Ok(())
}

/// Removes `target` when the write fails, so no truncated header is left behind.
fn write_all_or_discard(
    output: &mut impl Write,
    target: Option<&Path>,
    content: &str,
) -> std::io::Result<()> {
    let written = output
        .write_all(content.as_bytes())
        .and_then(|_| output.flush());
    if written.is_err() {
        if let Some(target) = target {
            if let Err(e) = std::fs::remove_file(target) {
                log::warn!("Cannot remove partial output {}: {e}", target.display());
            }
        }
    }
    written
}
