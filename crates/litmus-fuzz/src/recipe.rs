//! Compilation recipes: small stack-machine programs over files, emitted by
//! lifting and consumed by the machine stage's interpreter.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Coarse classification of recipe files, used by `PushInputs` filters.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct FileKind: u8 {
        const C_SRC = 1 << 0;
        const C_HEADER = 1 << 1;
        const OBJ = 1 << 2;
        const LITMUS = 1 << 3;
        const OTHER = 1 << 4;
    }
}

const FILE_KIND_NAMES: [(&str, FileKind); 5] = [
    ("c_src", FileKind::C_SRC),
    ("c_header", FileKind::C_HEADER),
    ("obj", FileKind::OBJ),
    ("litmus", FileKind::LITMUS),
    ("other", FileKind::OTHER),
];

impl FileKind {
    /// Classifies a file by its extension.
    pub fn of_path(path: &Path) -> FileKind {
        match path.extension().and_then(|e| e.to_str()) {
            Some("c") => FileKind::C_SRC,
            Some("h") => FileKind::C_HEADER,
            Some("o") => FileKind::OBJ,
            Some("litmus") => FileKind::LITMUS,
            _ => FileKind::OTHER,
        }
    }

    pub fn matches(self, path: &Path) -> bool {
        self.intersects(Self::of_path(path))
    }
}

impl Serialize for FileKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names: Vec<_> = FILE_KIND_NAMES
            .iter()
            .filter(|(_, k)| self.contains(*k))
            .map(|(n, _)| *n)
            .collect();
        names.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut kind = FileKind::empty();
        for name in &names {
            let (_, k) = FILE_KIND_NAMES
                .iter()
                .find(|(n, _)| n == name)
                .ok_or_else(|| serde::de::Error::custom(format!("bad file kind {name:?}")))?;
            kind |= *k;
        }
        Ok(kind)
    }
}

/// Opcodes of the recipe stack machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Nop,
    /// Push one named input file.
    PushInput,
    /// Push every unconsumed input matching a file-kind filter.
    PushInputs,
    /// Drain the stack into a fresh intermediate object.
    CompileObj,
    /// Drain the stack into the final binary; terminal.
    CompileExe,
}

/// One instruction, with any operands its opcode needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FileKind>,
}

impl Instruction {
    pub fn nop() -> Self {
        Self {
            op: Op::Nop,
            file: None,
            filter: None,
        }
    }

    pub fn push_input(file: impl Into<String>) -> Self {
        Self {
            op: Op::PushInput,
            file: Some(file.into()),
            filter: None,
        }
    }

    pub fn push_inputs(filter: FileKind) -> Self {
        Self {
            op: Op::PushInputs,
            file: None,
            filter: Some(filter),
        }
    }

    pub fn compile_obj() -> Self {
        Self {
            op: Op::CompileObj,
            file: None,
            filter: None,
        }
    }

    pub fn compile_exe() -> Self {
        Self {
            op: Op::CompileExe,
            file: None,
            filter: None,
        }
    }
}

/// What a fully executed recipe leaves behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    #[default]
    Nothing,
    Object,
    Executable,
}

/// A compilation plan for one subject on one architecture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Directory holding the recipe's input files.
    pub dir: PathBuf,
    /// Input file names, relative to `dir`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default)]
    pub output: OutputKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<Instruction>,
}

impl Recipe {
    pub fn new(dir: impl Into<PathBuf>, output: OutputKind) -> Self {
        Self {
            dir: dir.into(),
            output,
            ..Self::default()
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files.extend(files.into_iter().map(Into::into));
        self
    }

    pub fn with_instructions(mut self, instructions: impl IntoIterator<Item = Instruction>) -> Self {
        self.instructions.extend(instructions);
        self
    }

    /// Appends `PushInput(file); CompileObj`.
    pub fn compile_file_to_obj(mut self, file: impl Into<String>) -> Self {
        self.instructions.push(Instruction::push_input(file));
        self.instructions.push(Instruction::compile_obj());
        self
    }

    /// Appends `PushInputs(c_src); CompileExe`.
    pub fn compile_all_c_to_exe(mut self) -> Self {
        self.instructions
            .push(Instruction::push_inputs(FileKind::C_SRC));
        self.instructions.push(Instruction::compile_exe());
        self
    }

    /// The full path of a named input file.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Whether the instruction sequence is well-formed: at most one
    /// terminal instruction, and only in final position.
    pub fn check(&self) -> bool {
        self.instructions
            .iter()
            .position(|i| i.op == Op::CompileExe)
            .is_none_or(|pos| pos == self.instructions.len() - 1)
    }
}
