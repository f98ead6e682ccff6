//! Concrete wiring of the library's driver interfaces onto external
//! commands: a gcc-style compiler driver, command-driven fuzzer and stat
//! dumper, a directory-reading lifter, and a herd-style observation parser.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::{BufRead, Write},
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use litmus_fuzz::{
    id::Id,
    litmus::{StatDumper, StatError, Statset},
    machine::Machine,
    obs::{Flag, Obs, State, StateTag},
    quantity::Timeout,
    recipe::{OutputKind, Recipe},
    service::{
        DriverError, RunInfo,
        backend::{self, LiftError, LiftJob, ObsParseError},
        compiler::{self, CompileJob, CompileKind, InspectError, Inspector, Instance, optlevel},
        process,
    },
    stage::{
        invoker::{InvokeError, LocalFactory, MachineRunner, RunnerFactory},
        lifter::SingleLifter,
        mach::runner::ObsParser,
        fuzzer::{FuzzJob, SingleFuzzer},
        planner::{BackendFinder, CompilerLister},
    },
    plan::Plan,
    sync::Context,
};
use serde::Deserialize;

/// The JSON configuration file the director commands read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub machines: BTreeMap<Id, Machine>,
    /// Compilers offered to every machine.
    pub compilers: BTreeMap<Id, compiler::Compiler>,
    pub backend: backend::Spec,
    /// How to invoke the fuzzer; the job's paths and seed are appended.
    pub fuzzer: RunInfo,
    /// How to invoke the stat dumper; the litmus path is appended.
    pub stat_dumper: RunInfo,
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub out_dir: PathBuf,
    #[serde(default)]
    pub quantities: litmus_fuzz::quantity::RootSet,
    #[serde(default)]
    pub mutation: litmus_fuzz::mutation::Config,
    #[serde(default)]
    pub filter_file: Option<PathBuf>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// Serves compiler and backend listings straight from the config file.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub compilers: BTreeMap<Id, compiler::Compiler>,
    pub backend: backend::Spec,
}

impl CompilerLister for FileSource {
    fn list_compilers(
        &self,
        _machine: &Id,
    ) -> Result<BTreeMap<Id, compiler::Compiler>, DriverError> {
        Ok(self.compilers.clone())
    }
}

impl BackendFinder for FileSource {
    fn find_backend(&self, _machine: &Machine) -> Result<backend::Spec, DriverError> {
        Ok(self.backend.clone())
    }
}

/// Drives gcc-style compilers: `-O`/`-march` from the perturbed instance,
/// `-c` for objects, mutation choices exported through the environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct GccStyleDriver;

impl compiler::Driver for GccStyleDriver {
    fn run_compile(
        &self,
        ctx: &Context,
        instance: &Instance,
        job: &CompileJob,
        stderr: &mut dyn Write,
    ) -> Result<(), DriverError> {
        let run = instance.compiler.run.clone().unwrap_or_else(|| {
            RunInfo::new(instance.compiler.style.tags().first().cloned().unwrap_or_default())
        });

        let mut cmd = Command::new(&run.cmd);
        cmd.args(&run.args);
        if let Some(opt) = instance.selected_opt_name() {
            cmd.arg(format!("-O{opt}"));
        }
        if let Some(march) = &instance.selected_march {
            cmd.arg(format!("-march={march}"));
        }
        if job.kind == CompileKind::Obj {
            cmd.arg("-c");
        }
        cmd.arg("-o").arg(&job.out).args(&job.inputs);

        if let Some(mutant) = instance.mutant {
            cmd.env("MUTANT", mutant.to_string());
        }
        if let Some(time) = instance.config_time {
            cmd.env("CONFIG_TIME", time.timestamp().to_string());
        }

        process::run(ctx, cmd, job.timeout, &mut std::io::sink(), stderr)
    }
}

/// The optimisation levels and march values gcc-style compilers accept by
/// default.
#[derive(Debug, Clone, Copy, Default)]
pub struct GccStyleInspector;

impl Inspector for GccStyleInspector {
    fn default_opt_levels(
        &self,
        compiler: &compiler::Compiler,
    ) -> Result<BTreeMap<String, optlevel::Level>, InspectError> {
        let mut levels = self.opt_levels(compiler)?;
        // `fast` breaks standards, so it is out of the default draw.
        levels.retain(|_, l| !l.breaks_standards);
        Ok(levels)
    }

    fn opt_levels(
        &self,
        _compiler: &compiler::Compiler,
    ) -> Result<BTreeMap<String, optlevel::Level>, InspectError> {
        let speed = |breaks| optlevel::Level {
            optimises: true,
            bias: optlevel::Bias::Speed,
            breaks_standards: breaks,
        };
        Ok([
            (
                "0".to_owned(),
                optlevel::Level {
                    optimises: false,
                    bias: optlevel::Bias::Debug,
                    breaks_standards: false,
                },
            ),
            ("1".to_owned(), speed(false)),
            ("2".to_owned(), speed(false)),
            ("3".to_owned(), speed(false)),
            ("fast".to_owned(), speed(true)),
            (
                "s".to_owned(),
                optlevel::Level {
                    optimises: true,
                    bias: optlevel::Bias::Size,
                    breaks_standards: false,
                },
            ),
        ]
        .into())
    }

    fn default_marches(
        &self,
        _compiler: &compiler::Compiler,
    ) -> Result<BTreeSet<String>, InspectError> {
        // The perturber layers any configured march selection on top.
        Ok(BTreeSet::from(["native".to_owned()]))
    }
}

/// Runs the configured fuzzer command as
/// `cmd [args] <input> -o <litmus> -t <trace> -seed <seed>`.
#[derive(Debug, Clone)]
pub struct CommandFuzzer(pub RunInfo);

impl SingleFuzzer for CommandFuzzer {
    fn fuzz(&self, ctx: &Context, job: &FuzzJob) -> Result<(), DriverError> {
        let mut cmd = Command::new(&self.0.cmd);
        cmd.args(&self.0.args)
            .arg(&job.input)
            .arg("-o")
            .arg(&job.output_litmus)
            .arg("-t")
            .arg(&job.output_trace)
            .arg("-seed")
            .arg(job.seed.to_string());
        process::run(
            ctx,
            cmd,
            Timeout::default(),
            &mut std::io::sink(),
            &mut std::io::sink(),
        )
    }
}

/// Runs the configured stat dumper and parses its `key value` line output.
#[derive(Debug, Clone)]
pub struct CommandStatDumper(pub RunInfo);

impl StatDumper for CommandStatDumper {
    fn dump_stats(
        &self,
        ctx: &Context,
        stats: &mut Statset,
        path: &Path,
    ) -> Result<(), StatError> {
        let mut cmd = Command::new(&self.0.cmd);
        cmd.args(&self.0.args).arg(path);
        let mut out = Vec::new();
        process::run(ctx, cmd, Timeout::default(), &mut out, &mut std::io::sink())
            .map_err(|e| StatError::Driver(e.to_string()))?;
        parse_stats(&out, stats);
        Ok(())
    }
}

fn parse_stats(out: &[u8], stats: &mut Statset) {
    for line in out.split(|b| *b == b'\n') {
        let line = String::from_utf8_lossy(line);
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match key.split_once('.') {
            None if key == "threads" => stats.threads = value as usize,
            None if key == "returns" => stats.returns = value,
            Some(("atomics", ty)) => {
                stats.atomics.insert(ty.to_owned(), value);
            }
            Some(("mem_orders", order)) => {
                stats.mem_orders.insert(order.to_owned(), value);
            }
            _ => {}
        }
    }
}

/// Lifts by running the backend command as `cmd [args] <litmus> -o <dir>`,
/// then turns whatever landed in the directory into an exe recipe.
#[derive(Debug, Clone)]
pub struct CommandLifter(pub backend::Spec);

impl SingleLifter for CommandLifter {
    fn lift(&self, ctx: &Context, job: &LiftJob) -> Result<Recipe, LiftError> {
        job.check()?;
        let run = self.0.run.clone().unwrap_or_else(|| {
            RunInfo::new(self.0.style.tags().first().cloned().unwrap_or_default())
        });
        std::fs::create_dir_all(&job.output.dir)?;

        let mut cmd = Command::new(&run.cmd);
        cmd.args(&run.args)
            .arg(&job.input.litmus.path)
            .arg("-o")
            .arg(&job.output.dir);
        process::run(
            ctx,
            cmd,
            Timeout::default(),
            &mut std::io::sink(),
            &mut std::io::sink(),
        )?;

        let files = dir_files(&job.output.dir)?;
        Ok(Recipe::new(&job.output.dir, OutputKind::Executable)
            .with_files(files)
            .compile_all_c_to_exe())
    }
}

/// Non-directory entries of `dir`, sorted by name.
fn dir_files(dir: &Path) -> Result<Vec<String>, std::io::Error> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

/// Parses herd-style observation output.
///
/// The format, shared by herd and litmus-like tools, looks like:
///
/// ```text
/// Test mp Allowed
/// States 2
/// 2 *>0:r0=0; x=1;
/// 1 :>0:r0=1; x=1;
/// Ok
/// Condition exists (0:r0=0)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct HerdStyleParser;

impl ObsParser for HerdStyleParser {
    fn parse_obs(&self, r: &mut dyn BufRead) -> Result<Obs, ObsParseError> {
        let mut obs = Obs::default();
        let mut saw_verdict = false;
        for line in r.lines() {
            let line = line.map_err(|e| ObsParseError(e.to_string()))?;
            let line = line.trim();
            match line {
                "Ok" => {
                    obs.flags |= Flag::SAT;
                    saw_verdict = true;
                }
                "No" => {
                    obs.flags |= Flag::UNSAT;
                    saw_verdict = true;
                }
                "Undef" => {
                    obs.flags |= Flag::UNDEF;
                    saw_verdict = true;
                }
                _ if line.starts_with("Condition exists") => obs.flags |= Flag::EXIST,
                _ => {
                    if let Some(state) = parse_state_line(line) {
                        obs.states.push(state);
                    }
                }
            }
        }
        if !saw_verdict && obs.states.is_empty() {
            return Err(ObsParseError("no states or verdict in output".into()));
        }
        Ok(obs)
    }
}

/// Parses `<occurrences> <tag?>> var=val; var=val;` state lines.
fn parse_state_line(line: &str) -> Option<State> {
    let (head, rest) = line.split_once('>')?;
    let head = head.trim_end();
    let (occurrences, tag) = match head.strip_suffix('*') {
        Some(n) => (n, StateTag::Witness),
        None => match head.strip_suffix(':') {
            Some(n) => (n, StateTag::Counter),
            None => (head, StateTag::Unknown),
        },
    };
    let occurrences: u64 = occurrences.trim().parse().ok()?;

    let mut values = BTreeMap::new();
    for binding in rest.split(';') {
        let binding = binding.trim();
        if binding.is_empty() {
            continue;
        }
        let (var, val) = binding.split_once('=')?;
        values.insert(var.trim().to_owned(), val.trim().to_owned());
    }
    if values.is_empty() {
        return None;
    }
    Some(State {
        occurrences,
        tag,
        values,
    })
}

/// Spawns `self mach` with the machine's scratch directory.
#[derive(Debug)]
pub struct NodeFactory {
    pub out_dir: PathBuf,
    pub timeout_secs: Option<u64>,
}

impl RunnerFactory for NodeFactory {
    fn make_runner(&self, plan: &Plan) -> Result<Box<dyn MachineRunner>, InvokeError> {
        let scratch_root = self
            .out_dir
            .join("scratch")
            .join(plan.machine.id.to_string());
        let mut args = vec![
            "mach".to_owned(),
            "--out-dir".to_owned(),
            scratch_root.to_string_lossy().into_owned(),
        ];
        if let Some(secs) = self.timeout_secs {
            args.push("--timeout".to_owned());
            args.push(secs.to_string());
        }
        let factory = LocalFactory::self_exe(args)?;
        factory.make_runner(plan)
    }
}

/// Builds a director environment from the loaded configuration.
pub fn env_from_config(config: &ConfigFile, timeout_secs: Option<u64>) -> litmus_fuzz::director::Env {
    litmus_fuzz::director::Env {
        fuzzer: Some(Arc::new(CommandFuzzer(config.fuzzer.clone()))),
        stat_dumper: Some(Arc::new(CommandStatDumper(config.stat_dumper.clone()))),
        lifter: Some(Arc::new(CommandLifter(config.backend.clone()))),
        inspector: Some(Arc::new(GccStyleInspector)),
        source: Some(litmus_fuzz::stage::planner::Source {
            compilers: Arc::new(FileSource {
                compilers: config.compilers.clone(),
                backend: config.backend.clone(),
            }),
            backends: Arc::new(FileSource {
                compilers: config.compilers.clone(),
                backend: config.backend.clone(),
            }),
        }),
        runner_factory: Some(Arc::new(NodeFactory {
            out_dir: config.out_dir.clone(),
            timeout_secs,
        })),
    }
}
