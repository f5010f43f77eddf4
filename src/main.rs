// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// CLI entrypoint for asm24.

use std::process;

use clap::Parser;

use asm24::assembler::{run_with_cli, Cli};

fn main() {
    let cli = Cli::parse();
    if cli.files.is_empty() {
        eprintln!("asm24: expected at least 1 assembly source file name (without the .as suffix)");
        return;
    }

    match run_with_cli(&cli) {
        Ok(reports) => {
            for report in &reports {
                for diag in report.diagnostics() {
                    eprintln!("{}", diag.format_with_context(Some(report.source_lines())));
                }
                if !report.outputs_written() {
                    eprintln!(
                        "asm24: errors were found in \"{}\" - no output files produced",
                        report.file_name()
                    );
                }
            }
        }
        Err(err) => {
            eprintln!("asm24: {err}");
            process::exit(err.exit_code());
        }
    }
}
