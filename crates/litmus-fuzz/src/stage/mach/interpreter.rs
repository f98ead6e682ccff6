//! The recipe interpreter: a small stack machine that turns a recipe's
//! instructions into compile requests.

use std::{collections::BTreeMap, io::Write, path::PathBuf};

use crate::{
    quantity::Timeout,
    recipe::{Instruction, Op, Recipe},
    service::{
        DriverError,
        compiler::{CompileJob, CompileKind, Driver, Instance},
    },
    sync::Context,
};

/// Default cap on intermediate objects per recipe execution.
pub const MAX_OBJS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("instruction {0:?} missing its operand")]
    BadOp(Op),
    #[error("file {0:?} not available (unknown or already consumed)")]
    FileUnavailable(String),
    #[error("recipe produced too many intermediate objects")]
    ObjOverflow,
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Executes one recipe against one compiler instance.
///
/// The object counter is local to a single execution, so repeated runs of
/// the same recipe always number their intermediates identically.
pub struct Interpreter<'a> {
    driver: &'a dyn Driver,
    instance: &'a Instance,
    recipe: &'a Recipe,
    /// Where `CompileExe` writes the final binary.
    bin_path: PathBuf,
    timeout: Timeout,
    max_objs: usize,
    stack: Vec<PathBuf>,
    nobjs: usize,
    /// Unconsumed input files, keyed by recipe-relative name.
    available: BTreeMap<String, PathBuf>,
}

impl std::fmt::Debug for Interpreter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("bin_path", &self.bin_path)
            .field("nobjs", &self.nobjs)
            .finish_non_exhaustive()
    }
}

impl<'a> Interpreter<'a> {
    pub fn new(
        driver: &'a dyn Driver,
        instance: &'a Instance,
        recipe: &'a Recipe,
        bin_path: impl Into<PathBuf>,
        timeout: Timeout,
    ) -> Self {
        let available = recipe
            .files
            .iter()
            .map(|name| (name.clone(), recipe.file_path(name)))
            .collect();
        Self {
            driver,
            instance,
            recipe,
            bin_path: bin_path.into(),
            timeout,
            max_objs: MAX_OBJS,
            stack: Vec::new(),
            nobjs: 0,
            available,
        }
    }

    pub fn with_max_objs(mut self, max_objs: usize) -> Self {
        self.max_objs = max_objs;
        self
    }

    /// Runs the recipe to completion, streaming compiler stderr into `log`.
    pub fn run(&mut self, ctx: &Context, log: &mut dyn Write) -> Result<(), InterpretError> {
        for instruction in &self.recipe.instructions {
            match instruction.op {
                Op::Nop => {}
                Op::PushInput => self.push_input(instruction)?,
                Op::PushInputs => self.push_inputs(instruction)?,
                Op::CompileObj => self.compile_obj(ctx, log)?,
                Op::CompileExe => {
                    // Terminal: anything after this never runs.
                    return self.compile(ctx, CompileKind::Exe, self.bin_path.clone(), log);
                }
            }
        }
        Ok(())
    }

    fn push_input(&mut self, instruction: &Instruction) -> Result<(), InterpretError> {
        let name = instruction
            .file
            .as_deref()
            .ok_or(InterpretError::BadOp(Op::PushInput))?;
        let path = self
            .available
            .remove(name)
            .ok_or_else(|| InterpretError::FileUnavailable(name.to_owned()))?;
        self.stack.push(path);
        Ok(())
    }

    fn push_inputs(&mut self, instruction: &Instruction) -> Result<(), InterpretError> {
        let filter = instruction
            .filter
            .ok_or(InterpretError::BadOp(Op::PushInputs))?;
        let matching: Vec<String> = self
            .available
            .iter()
            .filter(|(_, path)| filter.matches(path))
            .map(|(name, _)| name.clone())
            .collect();
        for name in matching {
            if let Some(path) = self.available.remove(&name) {
                self.stack.push(path);
            }
        }
        Ok(())
    }

    fn compile_obj(&mut self, ctx: &Context, log: &mut dyn Write) -> Result<(), InterpretError> {
        if self.nobjs >= self.max_objs {
            return Err(InterpretError::ObjOverflow);
        }
        let out = self.recipe.dir.join(format!("obj_{}.o", self.nobjs));
        self.compile(ctx, CompileKind::Obj, out.clone(), log)?;
        self.nobjs += 1;
        self.stack.push(out);
        Ok(())
    }

    /// Drains the stack into one compile request.
    fn compile(
        &mut self,
        ctx: &Context,
        kind: CompileKind,
        out: PathBuf,
        log: &mut dyn Write,
    ) -> Result<(), InterpretError> {
        let inputs = std::mem::take(&mut self.stack);
        let job = CompileJob {
            kind,
            out,
            inputs,
            timeout: self.timeout,
        };
        self.driver.run_compile(ctx, self.instance, &job, log)?;
        Ok(())
    }
}
