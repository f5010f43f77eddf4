// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

// Assembler core pipeline: diagnostics, both passes, and the per-file driver.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};

use clap::Parser;

use crate::imagestore::{
    to_s21, to_s24, write_object_file, Are, ExtRefList, Word, WordImage, DEST_ADDR, DEST_REG,
    FUNCT, INITIAL_LOAD_ADDR, NON_ARE, OPCODE, SRC_ADDR, SRC_REG,
};
use crate::instructions::{
    find_instruction, register_index, validate_symbol_name, AddressingMode, Directive, Instruction,
    SymbolNameError, MAX_SYMBOL_LEN,
};
use crate::reader::{
    parse_decimal, parse_string_literal, read_source, IntError, SourceLine, StringError, Tokenizer,
    MAX_LINE_LEN,
};
use crate::symbol_table::{replacement_word, InstallResult, SymbolTable};

const VERSION: &str = "1.0";
const LONG_ABOUT: &str = "Two-pass assembler for the 24-bit educational machine.

Each BASE argument names an assembly source file BASE.as. A successful run
produces BASE.ob with the final machine code, BASE.ext when external symbols
are referenced, and BASE.ent when symbols are declared as entries. Source
errors are reported to stderr and suppress all three outputs for that file.";

#[derive(Parser, Debug)]
#[command(
    name = "asm24",
    version = VERSION,
    about = "Two-pass assembler for the 24-bit educational machine",
    long_about = LONG_ABOUT
)]
pub struct Cli {
    /// Source file base names; each is read from <BASE>.as.
    #[arg(value_name = "BASE")]
    pub files: Vec<String>,
}

/// Assemble every file named on the command line. Assembly errors land in
/// the per-file reports; only technical failures abort the run.
pub fn run_with_cli(cli: &Cli) -> Result<Vec<AsmRunReport>, FatalError> {
    let mut reports = Vec::new();
    for base in &cli.files {
        reports.push(run_one(base)?);
    }
    Ok(reports)
}

/// Assemble `<base>.as` and, when both passes are clean, emit `<base>.ob`
/// plus the optional `<base>.ext` and `<base>.ent`.
pub fn run_one(base: &str) -> Result<AsmRunReport, FatalError> {
    let source_name = format!("{base}.as");
    let source =
        File::open(&source_name).map_err(|err| FatalError::file_access(&source_name, &err))?;
    let lines = read_source(BufReader::new(source))
        .map_err(|err| FatalError::file_access(&source_name, &err))?;

    let mut assembler = Assembler::new();
    let pass1 = assembler.pass1(&lines);
    let pass2 = assembler.pass2(&lines);

    let mut outputs_written = false;
    if pass1.errors == 0 && pass2.errors == 0 {
        let ob_name = format!("{base}.ob");
        let mut ob_file =
            File::create(&ob_name).map_err(|err| FatalError::file_access(&ob_name, &err))?;
        write_object_file(&mut ob_file, assembler.code(), assembler.data())
            .map_err(|err| FatalError::write(&ob_name, &err))?;

        if !assembler.externals().is_empty() {
            let ext_name = format!("{base}.ext");
            let mut ext_file =
                File::create(&ext_name).map_err(|err| FatalError::file_access(&ext_name, &err))?;
            assembler
                .externals()
                .write_file(&mut ext_file)
                .map_err(|err| FatalError::write(&ext_name, &err))?;
        }

        if assembler.symbols().has_entries() {
            let ent_name = format!("{base}.ent");
            let mut ent_file =
                File::create(&ent_name).map_err(|err| FatalError::file_access(&ent_name, &err))?;
            assembler
                .symbols()
                .write_entries_file(&mut ent_file)
                .map_err(|err| FatalError::write(&ent_name, &err))?;
        }

        outputs_written = true;
    }

    let diagnostics = assembler
        .take_diagnostics()
        .into_iter()
        .map(|diag| diag.with_file(Some(source_name.clone())))
        .collect();
    let source_lines = lines.into_iter().map(|line| line.text).collect();
    Ok(AsmRunReport {
        file_name: source_name,
        diagnostics,
        source_lines,
        outputs_written,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmErrorKind {
    Assembler,
    Directive,
    Instruction,
    Operand,
    Reader,
    Symbol,
}

/// A recoverable assembly error with a kind and message.
#[derive(Debug, Clone)]
pub struct AsmError {
    kind: AsmErrorKind,
    message: String,
}

impl AsmError {
    fn new(kind: AsmErrorKind, msg: &str, param: Option<&str>) -> Self {
        Self {
            kind,
            message: format_error(msg, param),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> AsmErrorKind {
        self.kind
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AsmError {}

/// Format an error message with an optional parameter.
fn format_error(msg: &str, param: Option<&str>) -> String {
    match param {
        Some(p) => format!("{msg}: {p}"),
        None => msg.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A diagnostic message tied to a source line.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    line: u32,
    severity: Severity,
    error: AsmError,
    file: Option<String>,
}

impl Diagnostic {
    fn new(line: u32, severity: Severity, error: AsmError) -> Self {
        Self {
            line,
            severity,
            error,
            file: None,
        }
    }

    fn with_file(mut self, file: Option<String>) -> Self {
        self.file = file;
        self
    }

    pub fn format(&self) -> String {
        let sev = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        format!("{}: {} - {}", self.line, sev, self.error.message())
    }

    pub fn format_with_context(&self, lines: Option<&[String]>) -> String {
        let sev = match self.severity {
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        let header = match &self.file {
            Some(file) => format!("{file}:{}: {sev}", self.line),
            None => format!("{}: {sev}", self.line),
        };

        let mut out = String::new();
        out.push_str(&header);
        out.push('\n');
        let line_idx = self.line.saturating_sub(1) as usize;
        match lines.and_then(|lines| lines.get(line_idx)) {
            Some(line) => out.push_str(&format!("{:>5} | {}\n", self.line, line)),
            None => out.push_str(&format!("{:>5} | <source unavailable>\n", self.line)),
        }
        out.push_str(&format!("{sev}: {}", self.error.message()));
        out
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn kind(&self) -> AsmErrorKind {
        self.error.kind()
    }

    pub fn message(&self) -> &str {
        self.error.message()
    }
}

/// Everything one input file produced: its diagnostics, its source text for
/// context printing, and whether the artifacts were emitted.
#[derive(Debug)]
pub struct AsmRunReport {
    file_name: String,
    diagnostics: Vec<Diagnostic>,
    source_lines: Vec<String>,
    outputs_written: bool,
}

impl AsmRunReport {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn source_lines(&self) -> &[String] {
        &self.source_lines
    }

    pub fn outputs_written(&self) -> bool {
        self.outputs_written
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|diag| diag.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|diag| diag.severity == Severity::Warning)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalErrorKind {
    FileAccess,
    Write,
}

/// A technical failure. These are never recovered from: the driver stops and
/// the process exits with a kind-specific code.
#[derive(Debug)]
pub struct FatalError {
    kind: FatalErrorKind,
    message: String,
}

impl FatalError {
    fn file_access(path: &str, err: &io::Error) -> Self {
        Self {
            kind: FatalErrorKind::FileAccess,
            message: format!("cannot access \"{path}\": {err}"),
        }
    }

    fn write(path: &str, err: &io::Error) -> Self {
        Self {
            kind: FatalErrorKind::Write,
            message: format!("cannot write \"{path}\": {err}"),
        }
    }

    pub fn kind(&self) -> FatalErrorKind {
        self.kind
    }

    pub fn exit_code(&self) -> i32 {
        match self.kind {
            FatalErrorKind::FileAccess => 2,
            FatalErrorKind::Write => 3,
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FatalError {}

/// Pass statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassCounts {
    pub lines: u32,
    pub errors: u32,
    pub warnings: u32,
}

impl PassCounts {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-file assembler state: symbol table, both images, the external
/// reference list, and the collected diagnostics.
pub struct Assembler {
    symbols: SymbolTable,
    code: WordImage,
    data: WordImage,
    externals: ExtRefList,
    diagnostics: Vec<Diagnostic>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            code: WordImage::new(),
            data: WordImage::new(),
            externals: ExtRefList::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn code(&self) -> &WordImage {
        &self.code
    }

    pub fn data(&self) -> &WordImage {
        &self.data
    }

    pub fn externals(&self) -> &ExtRefList {
        &self.externals
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|diag| diag.severity == Severity::Error)
    }

    /// First pass: build the symbol table, the data image, and a provisional
    /// code image in which every symbol-dependent word is zero. Finishes by
    /// shifting data symbols past the end of the code image.
    pub fn pass1(&mut self, lines: &[SourceLine]) -> PassCounts {
        let mut pass = Pass1 {
            symbols: &mut self.symbols,
            code: &mut self.code,
            data: &mut self.data,
            diagnostics: &mut self.diagnostics,
            counts: PassCounts::new(),
            recording: true,
        };
        for (index, line) in lines.iter().enumerate() {
            let line_num = index as u32 + 1;
            if line.too_long {
                let msg = format!(
                    "Line too long - an assembly line may hold at most {MAX_LINE_LEN} characters"
                );
                pass.error(line_num, AsmErrorKind::Reader, &msg, None);
                continue;
            }
            pass.process_line(line_num, &line.text);
        }
        pass.counts.lines = lines.len() as u32;
        let counts = pass.counts;

        self.symbols
            .shift_data_addresses(self.code.len() as u32 + INITIAL_LOAD_ADDR);
        counts
    }

    /// Second pass: re-walk the source against the provisional code image,
    /// resolve symbol operands, mark entries, and record external
    /// references. Runs even after pass-1 errors so its own diagnostics are
    /// still reported, but then leaves the images untouched.
    pub fn pass2(&mut self, lines: &[SourceLine]) -> PassCounts {
        let mutating = !self.has_errors();
        let mut pass = Pass2 {
            symbols: &mut self.symbols,
            code: &mut self.code,
            externals: &mut self.externals,
            diagnostics: &mut self.diagnostics,
            counts: PassCounts::new(),
            cursor: 0,
            ic: INITIAL_LOAD_ADDR,
            mutating,
        };
        for (index, line) in lines.iter().enumerate() {
            let line_num = index as u32 + 1;
            if line.too_long {
                continue;
            }
            pass.process_line(line_num, &line.text);
        }
        pass.counts.lines = lines.len() as u32;
        pass.counts
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Operand of an instruction statement, tagged by addressing mode. Symbol
/// operands carry the name only; the table lookup happens in pass 2, at the
/// point of emission.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Immediate(Word),
    Direct(String),
    Relative(String),
    Register(u8),
}

impl Operand {
    fn mode(&self) -> AddressingMode {
        match self {
            Operand::Immediate(_) => AddressingMode::Immediate,
            Operand::Direct(_) => AddressingMode::Direct,
            Operand::Relative(_) => AddressingMode::Relative,
            Operand::Register(_) => AddressingMode::Register,
        }
    }

    fn register_field(&self) -> i64 {
        match self {
            Operand::Register(index) => *index as i64,
            _ => 0,
        }
    }
}

/// Encode an immediate operand's extension word.
fn immediate_word(value: i64) -> Word {
    let mut word = Word::default();
    word.set_field(NON_ARE, to_s21(value), 3);
    word.set_are(Are::Absolute);
    word
}

/// Build the first memory word of an instruction statement.
fn first_instruction_word(
    inst: &Instruction,
    src: Option<&Operand>,
    dest: Option<&Operand>,
) -> Word {
    let mut word = Word::default();
    word.set_are(Are::Absolute);
    word.set_field(FUNCT, inst.funct as i64, 3);
    word.set_field(OPCODE, inst.opcode as i64, 18);
    if let Some(dest) = dest {
        word.set_field(DEST_ADDR, dest.mode() as i64, 11);
        word.set_field(DEST_REG, dest.register_field(), 8);
    }
    if let Some(src) = src {
        word.set_field(SRC_ADDR, src.mode() as i64, 16);
        word.set_field(SRC_REG, src.register_field(), 13);
    }
    word
}

/// Line processor for the first pass. After the first error the images are
/// frozen (`recording` drops) while scanning continues, so every error in
/// the file is still found and later duplicate symbols are still caught.
struct Pass1<'a> {
    symbols: &'a mut SymbolTable,
    code: &'a mut WordImage,
    data: &'a mut WordImage,
    diagnostics: &'a mut Vec<Diagnostic>,
    counts: PassCounts,
    recording: bool,
}

impl Pass1<'_> {
    fn error(&mut self, line_num: u32, kind: AsmErrorKind, msg: &str, param: Option<&str>) {
        self.diagnostics.push(Diagnostic::new(
            line_num,
            Severity::Error,
            AsmError::new(kind, msg, param),
        ));
        self.counts.errors += 1;
        self.recording = false;
    }

    fn warning(&mut self, line_num: u32, kind: AsmErrorKind, msg: &str, param: Option<&str>) {
        self.diagnostics.push(Diagnostic::new(
            line_num,
            Severity::Warning,
            AsmError::new(kind, msg, param),
        ));
        self.counts.warnings += 1;
    }

    fn process_line(&mut self, line_num: u32, text: &str) {
        // A comment needs its ';' in column one.
        if text.starts_with(';') {
            return;
        }
        let mut tokens = Tokenizer::new(text);
        let Some(first) = tokens.next_token() else {
            return;
        };
        let (label, key) = if let Some(name) = first.strip_suffix(':') {
            match tokens.next_token() {
                Some(key) => (Some(name), key),
                None => {
                    self.warning(
                        line_num,
                        AsmErrorKind::Symbol,
                        "A symbol declaration was encountered in an empty line - it is ignored",
                        None,
                    );
                    return;
                }
            }
        } else {
            (None, first)
        };

        if key == "," {
            let place = if label.is_some() {
                "after a symbol declaration"
            } else {
                "at the beginning of a statement"
            };
            self.error(
                line_num,
                AsmErrorKind::Assembler,
                "An unexpected comma was encountered",
                Some(place),
            );
            return;
        }

        if let Some(name) = key.strip_prefix('.') {
            self.process_directive(line_num, name, label, &mut tokens);
        } else {
            self.process_instruction(line_num, key, label, &mut tokens);
        }
    }

    fn process_directive(
        &mut self,
        line_num: u32,
        name: &str,
        label: Option<&str>,
        tokens: &mut Tokenizer,
    ) {
        if name.is_empty() {
            self.error(
                line_num,
                AsmErrorKind::Directive,
                "Expected a directive name after the '.' character",
                None,
            );
            return;
        }
        let Some(directive) = Directive::from_name(name) else {
            self.error(
                line_num,
                AsmErrorKind::Directive,
                "Unknown directive",
                Some(name),
            );
            return;
        };
        match directive {
            Directive::Data | Directive::String => {
                if let Some(label) = label {
                    let address = if self.recording {
                        self.data.len() as u32
                    } else {
                        0
                    };
                    if !self.install_symbol(
                        line_num,
                        label,
                        address,
                        false,
                        true,
                        "while declaring a new symbol",
                    ) {
                        return;
                    }
                }
                if directive == Directive::Data {
                    self.process_data(line_num, tokens);
                } else {
                    self.process_string(line_num, tokens.rest());
                }
            }
            Directive::Extern => {
                if label.is_some() {
                    self.warning(
                        line_num,
                        AsmErrorKind::Directive,
                        "A symbol declaration was encountered in an \".extern\" statement - it is ignored",
                        None,
                    );
                }
                self.process_extern(line_num, tokens);
            }
            // Validated and applied in pass 2.
            Directive::Entry => {}
        }
    }

    fn process_data(&mut self, line_num: u32, tokens: &mut Tokenizer) {
        let Some(word) = self.next_data_value(
            line_num,
            tokens,
            "An unexpected comma follows the \".data\" directive name",
            "Expected at least one parameter in a \".data\" directive",
        ) else {
            return;
        };
        self.push_data(word);

        loop {
            let Some(token) = tokens.next_token() else {
                return;
            };
            if token != "," {
                self.error(
                    line_num,
                    AsmErrorKind::Directive,
                    "Expected a comma between \".data\" parameters",
                    Some(token),
                );
                return;
            }
            let Some(word) = self.next_data_value(
                line_num,
                tokens,
                "Multiple consecutive commas between \".data\" parameters",
                "An unexpected comma ends the \".data\" directive",
            ) else {
                return;
            };
            self.push_data(word);
        }
    }

    fn next_data_value(
        &mut self,
        line_num: u32,
        tokens: &mut Tokenizer,
        at_comma: &str,
        at_end: &str,
    ) -> Option<Word> {
        let Some(token) = tokens.next_token() else {
            self.error(line_num, AsmErrorKind::Directive, at_end, None);
            return None;
        };
        if token == "," {
            self.error(line_num, AsmErrorKind::Directive, at_comma, None);
            return None;
        }
        match parse_decimal(token) {
            Ok(value) => Some(Word::new(to_s24(value))),
            Err(_) => {
                self.error(
                    line_num,
                    AsmErrorKind::Directive,
                    "Every \".data\" parameter must be a decimal integer",
                    Some(token),
                );
                None
            }
        }
    }

    fn push_data(&mut self, word: Word) {
        if self.recording {
            self.data.push(word);
        }
    }

    fn process_string(&mut self, line_num: u32, rest: &str) {
        match parse_string_literal(rest) {
            Ok(text) => {
                if self.recording {
                    for byte in text.bytes() {
                        self.data.push(Word::from_char(byte));
                    }
                    self.data.push(Word::default());
                }
            }
            Err(StringError::Empty) => self.error(
                line_num,
                AsmErrorKind::Directive,
                "Expected a character string after the \".string\" directive name",
                None,
            ),
            Err(StringError::MissingOpenQuote) => self.error(
                line_num,
                AsmErrorKind::Directive,
                "A \".string\" argument must open with a double-quote character",
                None,
            ),
            Err(StringError::MissingCloseQuote) => self.error(
                line_num,
                AsmErrorKind::Directive,
                "A \".string\" argument must close with a double-quote character",
                None,
            ),
            Err(StringError::Unprintable) => self.error(
                line_num,
                AsmErrorKind::Directive,
                "A \".string\" argument may hold printable characters only",
                None,
            ),
        }
    }

    fn process_extern(&mut self, line_num: u32, tokens: &mut Tokenizer) {
        let Some(name) = tokens.next_token() else {
            self.error(
                line_num,
                AsmErrorKind::Directive,
                "An external symbol name was expected in an \".extern\" statement",
                None,
            );
            return;
        };
        if !self.install_symbol(
            line_num,
            name,
            0,
            true,
            false,
            "in an \".extern\" statement",
        ) {
            return;
        }
        self.check_line_end(
            line_num,
            tokens,
            "An \".extern\" statement expects a single parameter - extraneous text was encountered",
        );
    }

    fn process_instruction(
        &mut self,
        line_num: u32,
        mnemonic: &str,
        label: Option<&str>,
        tokens: &mut Tokenizer,
    ) {
        if let Some(label) = label {
            let address = if self.recording {
                self.code.len() as u32 + INITIAL_LOAD_ADDR
            } else {
                0
            };
            if !self.install_symbol(
                line_num,
                label,
                address,
                false,
                false,
                "while declaring a new symbol",
            ) {
                return;
            }
        }
        let Some(inst) = find_instruction(mnemonic) else {
            self.error(
                line_num,
                AsmErrorKind::Instruction,
                "Unknown instruction name",
                Some(mnemonic),
            );
            return;
        };
        let Some((src, dest)) = self.read_operands(line_num, inst, tokens) else {
            return;
        };
        if self.recording {
            self.code
                .push(first_instruction_word(inst, src.as_ref(), dest.as_ref()));
            if let Some(operand) = &src {
                self.push_operand_word(operand);
            }
            if let Some(operand) = &dest {
                self.push_operand_word(operand);
            }
        }
    }

    /// Read the operand list according to the descriptor's arity. Returns
    /// `(source, destination)`; a single-operand instruction fills only the
    /// destination slot.
    fn read_operands(
        &mut self,
        line_num: u32,
        inst: &'static Instruction,
        tokens: &mut Tokenizer,
    ) -> Option<(Option<Operand>, Option<Operand>)> {
        match inst.operands {
            0 => {
                if !self.check_line_end(
                    line_num,
                    tokens,
                    "The instruction expects no operands - extraneous text was encountered",
                ) {
                    return None;
                }
                Some((None, None))
            }
            1 => {
                let dest = self.read_operand(
                    line_num,
                    tokens,
                    "An unexpected comma follows the instruction name",
                )?;
                if !self.check_operand_mode(line_num, inst, &dest, false) {
                    return None;
                }
                if !self.check_line_end(
                    line_num,
                    tokens,
                    "The instruction expects a single operand - extraneous text was encountered",
                ) {
                    return None;
                }
                Some((None, Some(dest)))
            }
            _ => {
                let src = self.read_operand(
                    line_num,
                    tokens,
                    "An unexpected comma follows the instruction name",
                )?;
                if !self.check_operand_mode(line_num, inst, &src, true) {
                    return None;
                }
                match tokens.next_token() {
                    None => {
                        self.error(
                            line_num,
                            AsmErrorKind::Operand,
                            "The instruction expects 2 operands - the second operand is missing",
                            None,
                        );
                        return None;
                    }
                    Some(token) if token == "," => {}
                    Some(token) => {
                        self.error(
                            line_num,
                            AsmErrorKind::Operand,
                            "A comma is missing between operands",
                            Some(token),
                        );
                        return None;
                    }
                }
                let dest = self.read_operand(
                    line_num,
                    tokens,
                    "Multiple consecutive commas - expected a single comma between operands",
                )?;
                if !self.check_operand_mode(line_num, inst, &dest, false) {
                    return None;
                }
                if !self.check_line_end(
                    line_num,
                    tokens,
                    "The instruction expects exactly 2 operands - extraneous text was encountered",
                ) {
                    return None;
                }
                Some((Some(src), Some(dest)))
            }
        }
    }

    /// Classify one operand token by its first character.
    fn read_operand(
        &mut self,
        line_num: u32,
        tokens: &mut Tokenizer,
        at_comma: &str,
    ) -> Option<Operand> {
        let Some(token) = tokens.next_token() else {
            self.error(
                line_num,
                AsmErrorKind::Operand,
                "Too few operands were found in a code line",
                None,
            );
            return None;
        };
        if token == "," {
            self.error(line_num, AsmErrorKind::Operand, at_comma, None);
            return None;
        }
        if let Some(number) = token.strip_prefix('#') {
            return match parse_decimal(number) {
                Ok(value) => Some(Operand::Immediate(immediate_word(value))),
                Err(IntError::Empty) => {
                    self.error(
                        line_num,
                        AsmErrorKind::Operand,
                        "A decimal integer is missing after the '#' character of an immediate operand",
                        None,
                    );
                    None
                }
                Err(IntError::NotANumber) => {
                    self.error(
                        line_num,
                        AsmErrorKind::Operand,
                        "A decimal integer was expected after the '#' character of an immediate operand",
                        Some(number),
                    );
                    None
                }
            };
        }
        if let Some(index) = register_index(token) {
            return Some(Operand::Register(index));
        }
        if let Some(name) = token.strip_prefix('&') {
            if !self.check_symbol_name(
                line_num,
                name,
                "after the '&' character of a relative operand",
            ) {
                return None;
            }
            return Some(Operand::Relative(name.to_string()));
        }
        if !self.check_symbol_name(line_num, token, "in a direct operand") {
            return None;
        }
        Some(Operand::Direct(token.to_string()))
    }

    fn check_operand_mode(
        &mut self,
        line_num: u32,
        inst: &Instruction,
        operand: &Operand,
        is_source: bool,
    ) -> bool {
        let modes = if is_source {
            inst.src_modes
        } else {
            inst.dest_modes
        };
        if modes.allows(operand.mode()) {
            return true;
        }
        let slot = if is_source { "source" } else { "destination" };
        let msg = format!(
            "The {slot} operand of the '{}' instruction uses an addressing mode the instruction does not accept",
            inst.mnemonic
        );
        self.error(line_num, AsmErrorKind::Operand, &msg, None);
        false
    }

    fn push_operand_word(&mut self, operand: &Operand) {
        match operand {
            Operand::Immediate(word) => self.code.push(*word),
            // The symbol is unresolved in this pass; a zero placeholder
            // holds the slot for pass 2.
            Operand::Direct(_) | Operand::Relative(_) => self.code.push(Word::default()),
            Operand::Register(_) => {}
        }
    }

    /// Validate a symbol name and install it. Returns false (with the
    /// diagnostic already emitted) when the name is bad or already taken.
    fn install_symbol(
        &mut self,
        line_num: u32,
        name: &str,
        address: u32,
        is_extern: bool,
        is_data: bool,
        place: &str,
    ) -> bool {
        if !self.check_symbol_name(line_num, name, place) {
            return false;
        }
        let word = replacement_word(address, is_extern);
        match self.symbols.install(name, word, is_extern, false, is_data) {
            InstallResult::Installed => true,
            InstallResult::Duplicate => {
                self.error(
                    line_num,
                    AsmErrorKind::Symbol,
                    "A symbol with this name already exists",
                    Some(name),
                );
                false
            }
        }
    }

    fn check_symbol_name(&mut self, line_num: u32, name: &str, place: &str) -> bool {
        let msg = match validate_symbol_name(name) {
            Ok(()) => return true,
            Err(SymbolNameError::Empty) => {
                format!("Expected a symbol name {place}, but no characters were found")
            }
            Err(SymbolNameError::NotAlphaStart) => format!(
                "Invalid symbol name '{name}' was found {place} - a symbol name starts with an alphabetic character"
            ),
            Err(SymbolNameError::NotAlnum) => format!(
                "Invalid symbol name '{name}' was found {place} - a symbol name holds only alphabetic characters and decimal digits"
            ),
            Err(SymbolNameError::TooLong) => format!(
                "The symbol name '{name}' found {place} is longer than {MAX_SYMBOL_LEN} characters"
            ),
            Err(SymbolNameError::Reserved) => format!(
                "Invalid symbol name '{name}' was found {place} - a symbol name cannot be a reserved word"
            ),
        };
        self.error(line_num, AsmErrorKind::Symbol, &msg, None);
        false
    }

    fn check_line_end(&mut self, line_num: u32, tokens: &mut Tokenizer, msg: &str) -> bool {
        match tokens.next_token() {
            None => true,
            Some(token) => {
                self.error(line_num, AsmErrorKind::Assembler, msg, Some(token));
                false
            }
        }
    }
}

/// Line processor for the second pass. `cursor` walks the provisional code
/// image in step with `ic`, the instruction counter. Once any error exists,
/// `mutating` drops and the image and externals list are left untouched
/// while symbol-resolution diagnostics keep coming.
struct Pass2<'a> {
    symbols: &'a mut SymbolTable,
    code: &'a mut WordImage,
    externals: &'a mut ExtRefList,
    diagnostics: &'a mut Vec<Diagnostic>,
    counts: PassCounts,
    cursor: usize,
    ic: u32,
    mutating: bool,
}

impl Pass2<'_> {
    fn error(&mut self, line_num: u32, kind: AsmErrorKind, msg: &str, param: Option<&str>) {
        self.diagnostics.push(Diagnostic::new(
            line_num,
            Severity::Error,
            AsmError::new(kind, msg, param),
        ));
        self.counts.errors += 1;
        self.mutating = false;
    }

    fn warning(&mut self, line_num: u32, kind: AsmErrorKind, msg: &str, param: Option<&str>) {
        self.diagnostics.push(Diagnostic::new(
            line_num,
            Severity::Warning,
            AsmError::new(kind, msg, param),
        ));
        self.counts.warnings += 1;
    }

    fn process_line(&mut self, line_num: u32, text: &str) {
        if text.starts_with(';') {
            return;
        }
        let mut tokens = Tokenizer::new(text);
        let Some(first) = tokens.next_token() else {
            return;
        };
        let (labelled, key) = if first.ends_with(':') {
            match tokens.next_token() {
                Some(key) => (true, key),
                // The lone-label warning was issued in pass 1.
                None => return,
            }
        } else {
            (false, first)
        };

        if let Some(name) = key.strip_prefix('.') {
            if Directive::from_name(name) == Some(Directive::Entry) {
                self.process_entry(line_num, labelled, &mut tokens);
            }
            return;
        }
        // Statements pass 1 rejected are skipped without another report.
        if find_instruction(key).is_none() {
            return;
        }
        self.process_instruction(line_num, &mut tokens);
    }

    fn process_entry(&mut self, line_num: u32, labelled: bool, tokens: &mut Tokenizer) {
        if labelled {
            self.warning(
                line_num,
                AsmErrorKind::Directive,
                "A symbol declaration was encountered in an \".entry\" statement - it is ignored",
                None,
            );
        }
        let Some(name) = tokens.next_token() else {
            self.error(
                line_num,
                AsmErrorKind::Directive,
                "A symbol name was expected in an \".entry\" statement",
                None,
            );
            return;
        };
        let flags = self
            .symbols
            .lookup(name)
            .map(|symbol| symbol.is_extern);
        match flags {
            None => {
                self.error(
                    line_num,
                    AsmErrorKind::Symbol,
                    "Unknown symbol in an \".entry\" statement",
                    Some(name),
                );
                return;
            }
            Some(true) => {
                self.error(
                    line_num,
                    AsmErrorKind::Symbol,
                    "An \".entry\" statement expects an internal symbol, but this symbol is external",
                    Some(name),
                );
                return;
            }
            Some(false) => {
                self.symbols.mark_entry(name);
            }
        }
        if let Some(token) = tokens.next_token() {
            self.error(
                line_num,
                AsmErrorKind::Assembler,
                "An \".entry\" statement expects a single parameter - extraneous text was encountered",
                Some(token),
            );
        }
    }

    fn process_instruction(&mut self, line_num: u32, tokens: &mut Tokenizer) {
        let inst_start = self.ic;
        // The first instruction word was fully encoded in pass 1.
        if self.mutating {
            self.cursor += 1;
            self.ic += 1;
        }
        loop {
            let Some(token) = tokens.next_token() else {
                return;
            };
            if token == "," {
                // Malformed operand list, alerted in pass 1.
                return;
            }
            if !self.resolve_operand(line_num, token, inst_start) {
                return;
            }
            match tokens.next_token() {
                None => return,
                Some(token) if token == "," => {}
                Some(_) => return,
            }
        }
    }

    /// Resolve one operand against the symbol table and complete its word in
    /// the code image. Returns false when a resolution error was reported.
    fn resolve_operand(&mut self, line_num: u32, token: &str, inst_start: u32) -> bool {
        if token.starts_with('#') {
            // Encoded in pass 1; skip its extension word.
            if self.mutating {
                self.cursor += 1;
                self.ic += 1;
            }
            return true;
        }
        if register_index(token).is_some() {
            return true;
        }
        if let Some(name) = token.strip_prefix('&') {
            let target = self
                .symbols
                .lookup(name)
                .map(|symbol| (symbol.address(), symbol.is_extern));
            let Some((address, is_extern)) = target else {
                self.error(
                    line_num,
                    AsmErrorKind::Symbol,
                    "Unknown symbol after the '&' character of a relative operand",
                    Some(name),
                );
                return false;
            };
            if is_extern {
                self.error(
                    line_num,
                    AsmErrorKind::Symbol,
                    "A relative operand may name internal symbols only, but this symbol is external",
                    Some(name),
                );
                return false;
            }
            if self.mutating {
                let mut word = Word::default();
                word.set_field(NON_ARE, to_s21(address as i64 - inst_start as i64), 3);
                word.set_are(Are::Absolute);
                self.code.set(self.cursor, word);
                self.cursor += 1;
                self.ic += 1;
            }
            return true;
        }

        // Direct addressing: the symbol's replacement word lands in the
        // placeholder slot.
        let target = self
            .symbols
            .lookup(token)
            .map(|symbol| (symbol.rep_word, symbol.is_extern));
        let Some((rep_word, is_extern)) = target else {
            self.error(
                line_num,
                AsmErrorKind::Symbol,
                "Unknown symbol in a direct operand",
                Some(token),
            );
            return false;
        };
        if self.mutating {
            if is_extern {
                self.externals.push(token, self.ic);
            }
            self.code.set(self.cursor, rep_word);
            self.cursor += 1;
            self.ic += 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{
        run_one, Assembler, AsmErrorKind, Cli, Diagnostic, PassCounts, Severity,
    };
    use crate::imagestore::{write_object_file, INITIAL_LOAD_ADDR};
    use crate::reader::{read_source, SourceLine};
    use clap::Parser;
    use std::fs;
    use std::io::Cursor;

    fn source_lines(src: &str) -> Vec<SourceLine> {
        read_source(Cursor::new(src.as_bytes().to_vec())).expect("in-memory read")
    }

    fn assemble(src: &str) -> (Assembler, PassCounts, PassCounts) {
        let lines = source_lines(src);
        let mut assembler = Assembler::new();
        let pass1 = assembler.pass1(&lines);
        let pass2 = assembler.pass2(&lines);
        (assembler, pass1, pass2)
    }

    fn code_bits(assembler: &Assembler) -> Vec<u32> {
        assembler
            .code()
            .words()
            .iter()
            .map(|word| word.bits())
            .collect()
    }

    fn data_bits(assembler: &Assembler) -> Vec<u32> {
        assembler
            .data()
            .words()
            .iter()
            .map(|word| word.bits())
            .collect()
    }

    fn object_text(assembler: &Assembler) -> String {
        let mut out = Vec::new();
        write_object_file(&mut out, assembler.code(), assembler.data()).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn first_error(assembler: &Assembler) -> &Diagnostic {
        assembler
            .diagnostics()
            .iter()
            .find(|diag| diag.severity() == Severity::Error)
            .expect("an error diagnostic")
    }

    #[test]
    fn cli_parses_positional_bases() {
        let cli = Cli::parse_from(["asm24", "first", "second"]);
        assert_eq!(cli.files, vec!["first".to_string(), "second".to_string()]);

        let empty = Cli::parse_from(["asm24"]);
        assert!(empty.files.is_empty());
    }

    #[test]
    fn stop_assembles_to_one_absolute_word() {
        let (assembler, pass1, pass2) = assemble("stop\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(pass2.errors, 0);
        assert_eq!(code_bits(&assembler), vec![0x3c0004]);
        assert!(assembler.data().is_empty());
        assert!(assembler.externals().is_empty());
        assert!(!assembler.symbols().has_entries());
        assert_eq!(object_text(&assembler), "1 0\n0000100 3c0004");
    }

    #[test]
    fn external_direct_reference_records_use_site() {
        let (assembler, pass1, pass2) = assemble(".extern X\njmp X\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(pass2.errors, 0);
        assert_eq!(code_bits(&assembler), vec![0x24080c, 0x000001]);

        let refs = assembler.externals().refs();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "X");
        assert_eq!(refs[0].address, 101);

        let mut out = Vec::new();
        assembler.externals().write_file(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "X 0000101");
    }

    #[test]
    fn entry_data_symbol_is_shifted_past_the_code_image() {
        let (assembler, pass1, pass2) = assemble(".entry L\nL: .data 5, -1\nstop\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(pass2.errors, 0);
        assert_eq!(assembler.code().len(), 1);
        assert_eq!(data_bits(&assembler), vec![0x000005, 0xffffff]);

        let symbol = assembler.symbols().lookup("L").unwrap();
        assert!(symbol.is_entry);
        assert!(symbol.is_data);
        assert_eq!(symbol.address(), 101);

        let mut out = Vec::new();
        assembler.symbols().write_entries_file(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "L 0000101");
        assert_eq!(
            object_text(&assembler),
            "1 2\n0000100 3c0004\n\n0000101 000005\n0000102 ffffff"
        );
    }

    #[test]
    fn relative_operand_encodes_signed_distance() {
        let (assembler, pass1, pass2) = assemble("HERE: jmp &HERE\nstop\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(pass2.errors, 0);
        assert_eq!(
            code_bits(&assembler),
            vec![0x24100c, 0x000004, 0x3c0004]
        );
        assert_eq!(
            assembler.symbols().lookup("HERE").unwrap().address(),
            INITIAL_LOAD_ADDR
        );
    }

    #[test]
    fn backward_relative_distance_is_negative() {
        let (assembler, _, pass2) = assemble("FIRST: stop\njmp &FIRST\n");
        assert_eq!(pass2.errors, 0);
        // jmp starts at 101; FIRST is 100; distance -1 in the non-ARE field.
        assert_eq!(code_bits(&assembler)[2], 0xfffffc);
    }

    #[test]
    fn register_pair_packs_into_a_single_word() {
        let (assembler, pass1, _) = assemble("mov r3, r5\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(code_bits(&assembler), vec![0x037d04]);
    }

    #[test]
    fn immediate_operand_adds_an_extension_word() {
        let (assembler, pass1, _) = assemble("mov #-1, r2\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(code_bits(&assembler), vec![0x001a04, 0xfffffc]);
    }

    #[test]
    fn string_directive_emits_chars_and_terminator() {
        let (assembler, pass1, _) = assemble("S: .string \"Hi\"\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(data_bits(&assembler), vec![0x48, 0x69, 0x00]);
        assert_eq!(
            assembler.symbols().lookup("S").unwrap().address(),
            INITIAL_LOAD_ADDR
        );
    }

    #[test]
    fn direct_operand_takes_the_replacement_word() {
        let (assembler, pass1, pass2) = assemble("MAIN: stop\njmp MAIN\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(pass2.errors, 0);
        // MAIN at 100, relocatable: 100 << 3 | 2.
        assert_eq!(code_bits(&assembler)[2], (100 << 3) | 2);
    }

    #[test]
    fn externals_file_lists_every_appearance_in_order() {
        let (assembler, _, pass2) =
            assemble(".extern X\n.extern Y\njmp X\njmp Y\njmp X\n");
        assert_eq!(pass2.errors, 0);
        let refs = assembler.externals().refs();
        let pairs: Vec<(&str, u32)> = refs
            .iter()
            .map(|ext| (ext.name.as_str(), ext.address))
            .collect();
        assert_eq!(pairs, vec![("X", 101), ("Y", 103), ("X", 105)]);
    }

    #[test]
    fn duplicate_symbol_is_reported() {
        let (assembler, pass1, _) = assemble("L: stop\nL: stop\n");
        assert_eq!(pass1.errors, 1);
        let diag = first_error(&assembler);
        assert_eq!(diag.kind(), AsmErrorKind::Symbol);
        assert!(diag.message().contains("already exists"));
        assert_eq!(diag.line(), 2);
    }

    #[test]
    fn extern_conflicting_with_a_label_is_reported() {
        let (_, pass1, _) = assemble(".extern L\nL: stop\n");
        assert_eq!(pass1.errors, 1);
    }

    #[test]
    fn unknown_mnemonic_is_reported_once() {
        let (assembler, pass1, pass2) = assemble("bogus\n");
        assert_eq!(pass1.errors, 1);
        assert_eq!(pass2.errors, 0);
        assert_eq!(first_error(&assembler).kind(), AsmErrorKind::Instruction);
    }

    #[test]
    fn unknown_directive_is_reported() {
        let (assembler, pass1, _) = assemble(".bogus 1\n");
        assert_eq!(pass1.errors, 1);
        assert_eq!(first_error(&assembler).kind(), AsmErrorKind::Directive);
    }

    #[test]
    fn reserved_word_label_is_reported() {
        let (assembler, pass1, _) = assemble("mov: stop\n");
        assert_eq!(pass1.errors, 1);
        assert!(first_error(&assembler).message().contains("reserved word"));
    }

    #[test]
    fn forbidden_addressing_mode_is_reported() {
        let (assembler, pass1, _) = assemble("lea #1, r1\n");
        assert_eq!(pass1.errors, 1);
        assert!(first_error(&assembler).message().contains("source operand"));

        let (assembler, pass1, _) = assemble("mov r1, #2\n");
        assert_eq!(pass1.errors, 1);
        assert!(first_error(&assembler)
            .message()
            .contains("destination operand"));
    }

    #[test]
    fn operand_list_syntax_errors() {
        let (_, pass1, _) = assemble("mov r1 r2\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble("mov r1,,r2\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble("mov r1\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble("clr\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble("stop r1\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble("mov , r2\n");
        assert_eq!(pass1.errors, 1);
    }

    #[test]
    fn data_list_syntax_errors() {
        let (_, pass1, _) = assemble(".data\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble(".data 1,\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble(".data 1,,2\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble(".data 1 2\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble(".data one\n");
        assert_eq!(pass1.errors, 1);
    }

    #[test]
    fn string_syntax_errors() {
        let (_, pass1, _) = assemble(".string\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble(".string abc\"\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble(".string \"abc\n");
        assert_eq!(pass1.errors, 1);
    }

    #[test]
    fn lone_label_is_a_warning_and_is_dropped() {
        let (assembler, pass1, _) = assemble("L:\nstop\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(pass1.warnings, 1);
        assert!(assembler.symbols().lookup("L").is_none());
    }

    #[test]
    fn label_on_extern_warns_and_is_dropped() {
        let (assembler, pass1, _) = assemble("A: .extern X\nstop\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(pass1.warnings, 1);
        assert!(assembler.symbols().lookup("A").is_none());
        assert!(assembler.symbols().lookup("X").unwrap().is_extern);
    }

    #[test]
    fn label_on_entry_warns_in_pass_2() {
        let (_, pass1, pass2) = assemble("A: .entry L\nL: stop\n");
        assert_eq!(pass1.warnings, 0);
        assert_eq!(pass2.warnings, 1);
        assert_eq!(pass2.errors, 0);
    }

    #[test]
    fn entry_of_unknown_symbol_is_a_pass_2_error() {
        let (assembler, pass1, pass2) = assemble(".entry MISSING\nstop\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(pass2.errors, 1);
        assert_eq!(first_error(&assembler).kind(), AsmErrorKind::Symbol);
    }

    #[test]
    fn entry_of_external_symbol_is_rejected() {
        let (_, _, pass2) = assemble(".extern X\n.entry X\nstop\n");
        assert_eq!(pass2.errors, 1);
    }

    #[test]
    fn relative_reference_to_external_symbol_is_rejected() {
        let (_, _, pass2) = assemble(".extern X\njmp &X\n");
        assert_eq!(pass2.errors, 1);
    }

    #[test]
    fn unknown_direct_symbol_is_a_pass_2_error() {
        let (_, pass1, pass2) = assemble("jmp NOWHERE\n");
        assert_eq!(pass1.errors, 0);
        assert_eq!(pass2.errors, 1);
    }

    #[test]
    fn line_length_boundary() {
        let exact = format!("{:<width$}\n", "stop", width = 80);
        let (_, pass1, _) = assemble(&exact);
        assert_eq!(pass1.errors, 0);

        let long = format!("{:<width$}\n", "stop", width = 81);
        let (assembler, pass1, _) = assemble(&long);
        assert_eq!(pass1.errors, 1);
        assert_eq!(first_error(&assembler).kind(), AsmErrorKind::Reader);
    }

    #[test]
    fn indented_semicolon_is_not_a_comment() {
        let (_, pass1, _) = assemble("; a comment\nstop\n");
        assert_eq!(pass1.errors, 0);

        let (_, pass1, _) = assemble("   ; not a comment\nstop\n");
        assert_eq!(pass1.errors, 1);
    }

    #[test]
    fn images_freeze_after_the_first_error() {
        let (assembler, pass1, _) = assemble("bogus\nstop\n.data 7\n");
        assert_eq!(pass1.errors, 1);
        assert!(assembler.code().is_empty());
        assert!(assembler.data().is_empty());
    }

    #[test]
    fn later_duplicates_are_still_found_after_an_error() {
        let (_, pass1, _) = assemble("bogus\nL: stop\nL: stop\n");
        assert_eq!(pass1.errors, 2);
    }

    #[test]
    fn comma_as_statement_key_is_reported() {
        let (_, pass1, _) = assemble(", stop\n");
        assert_eq!(pass1.errors, 1);

        let (_, pass1, _) = assemble("L: , stop\n");
        assert_eq!(pass1.errors, 1);
    }

    #[test]
    fn diagnostic_format_includes_line_and_severity() {
        let (assembler, _, _) = assemble("bogus\n");
        let diag = first_error(&assembler);
        let rendered = diag.format();
        assert!(rendered.starts_with("1: ERROR - "));
        assert!(rendered.contains("bogus"));
    }

    #[test]
    fn diagnostic_context_names_file_and_shows_line() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("prog");
        fs::write(dir.path().join("prog.as"), "bogus\n").unwrap();
        let report = run_one(base.to_str().unwrap()).unwrap();

        let rendered =
            report.diagnostics()[0].format_with_context(Some(report.source_lines()));
        assert!(rendered.contains("prog.as:1: ERROR"));
        assert!(rendered.contains("    1 | bogus"));
        assert!(rendered.ends_with("ERROR: Unknown instruction name: bogus"));
    }

    #[test]
    fn run_one_emits_all_three_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("prog");
        let base = base.to_str().unwrap();
        fs::write(
            format!("{base}.as"),
            ".extern X\n.entry MAIN\nMAIN: jmp X\nstop\n",
        )
        .unwrap();

        let report = run_one(base).unwrap();
        assert!(report.outputs_written());
        assert_eq!(report.error_count(), 0);

        let ob = fs::read_to_string(format!("{base}.ob")).unwrap();
        assert_eq!(ob, "3 0\n0000100 24080c\n0000101 000001\n0000102 3c0004");
        let ext = fs::read_to_string(format!("{base}.ext")).unwrap();
        assert_eq!(ext, "X 0000101");
        let ent = fs::read_to_string(format!("{base}.ent")).unwrap();
        assert_eq!(ent, "MAIN 0000100");
    }

    #[test]
    fn run_one_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("prog");
        let base = base.to_str().unwrap();
        fs::write(format!("{base}.as"), "L: .data 1, 2\n.entry L\nstop\n").unwrap();

        run_one(base).unwrap();
        let first_ob = fs::read(format!("{base}.ob")).unwrap();
        let first_ent = fs::read(format!("{base}.ent")).unwrap();
        run_one(base).unwrap();
        assert_eq!(fs::read(format!("{base}.ob")).unwrap(), first_ob);
        assert_eq!(fs::read(format!("{base}.ent")).unwrap(), first_ent);
    }

    #[test]
    fn run_one_suppresses_outputs_on_source_errors() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("broken");
        let base = base.to_str().unwrap();
        fs::write(format!("{base}.as"), "bogus\n").unwrap();

        let report = run_one(base).unwrap();
        assert!(!report.outputs_written());
        assert_eq!(report.error_count(), 1);
        assert!(fs::metadata(format!("{base}.ob")).is_err());
    }

    #[test]
    fn run_one_skips_ext_and_ent_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("plain");
        let base = base.to_str().unwrap();
        fs::write(format!("{base}.as"), "stop\n").unwrap();

        let report = run_one(base).unwrap();
        assert!(report.outputs_written());
        assert!(fs::metadata(format!("{base}.ob")).is_ok());
        assert!(fs::metadata(format!("{base}.ext")).is_err());
        assert!(fs::metadata(format!("{base}.ent")).is_err());
    }

    #[test]
    fn run_one_reports_missing_source_as_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("absent");
        let err = run_one(base.to_str().unwrap()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn warnings_do_not_suppress_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("warned");
        let base = base.to_str().unwrap();
        fs::write(format!("{base}.as"), "L:\nstop\n").unwrap();

        let report = run_one(base).unwrap();
        assert_eq!(report.warning_count(), 1);
        assert!(report.outputs_written());
        assert!(fs::metadata(format!("{base}.ob")).is_ok());
    }
}
