//! Pre-computed path layouts for the director and its machine nodes.

use std::path::{Path, PathBuf};

use crate::{
    id::Id,
    plan::stage::Stage,
    stage::{
        analyser::saver,
        fuzzer::SubjectPather,
        lifter::LiftPather,
        mach::compiler::CompilePather,
    },
    subject::CompileFileset,
};

/// The director's root path layout.
#[derive(Debug, Clone)]
pub struct Pathset {
    root: PathBuf,
}

impl Pathset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where failing subjects get archived.
    pub fn saved(&self) -> saver::Pathset {
        saver::Pathset::new(self.root.join("saved"))
    }

    /// The scratch layout for one machine's cycles.
    pub fn scratch(&self, machine: &Id) -> Scratch {
        Scratch::new(self.root.join("scratch").join(machine.to_string()))
    }
}

/// Per-machine scratch directories, one per kind of stage output.
#[derive(Debug, Clone)]
pub struct Scratch {
    pub dir_fuzz: PathBuf,
    pub dir_lift: PathBuf,
    pub dir_plan: PathBuf,
    pub dir_run: PathBuf,
}

impl Scratch {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            dir_fuzz: root.join("fuzz"),
            dir_lift: root.join("lift"),
            dir_plan: root.join("plans"),
            dir_run: root.join("run"),
        }
    }

    /// Creates every scratch directory.
    pub fn prepare(&self) -> std::io::Result<()> {
        for dir in [&self.dir_fuzz, &self.dir_lift, &self.dir_plan, &self.dir_run] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// The plan file as it stands after `stage`.
    pub fn plan_file(&self, stage: Stage) -> PathBuf {
        self.dir_plan
            .join(format!("plan.{}.json", stage.to_string().to_lowercase()))
    }
}

impl SubjectPather for Scratch {
    fn prepare(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir_fuzz)
    }

    fn subject_litmus(&self, name: &str) -> PathBuf {
        self.dir_fuzz.join(format!("{name}.litmus"))
    }

    fn subject_trace(&self, name: &str) -> PathBuf {
        self.dir_fuzz.join(format!("{name}.trace.txt"))
    }
}

impl LiftPather for Scratch {
    fn prepare(&self, arches: &[Id]) -> std::io::Result<()> {
        for arch in arches {
            std::fs::create_dir_all(self.dir_lift.join(arch.to_string()))?;
        }
        Ok(())
    }

    fn lift_dir(&self, arch: &Id, name: &str) -> PathBuf {
        self.dir_lift.join(arch.to_string()).join(name)
    }
}

impl CompilePather for Scratch {
    fn prepare(&self, compilers: &[Id]) -> std::io::Result<()> {
        for cid in compilers {
            std::fs::create_dir_all(self.dir_run.join(cid.to_string()))?;
        }
        Ok(())
    }

    fn compile_paths(&self, compiler: &Id, name: &str) -> CompileFileset {
        let dir = self.dir_run.join(compiler.to_string()).join(name);
        CompileFileset {
            bin: dir.join("a.out"),
            log: dir.join("compile.log"),
        }
    }
}
