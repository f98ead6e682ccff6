//! The perturber: re-rolls each compiler's configuration before a fuzz
//! cycle.

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use rand::{Rng, rngs::StdRng, seq::IteratorRandom};
use tracing::debug;

use crate::{
    plan::{Plan, stage::Stage},
    service::compiler::{Inspector, Instance, optlevel},
    stage::{ConfigError, StageError, StageRunner, confirm},
    sync::Context,
};

/// Perturbs compiler instances using the inspector's default sets.
pub struct Perturber {
    inspector: Arc<dyn Inspector + Send + Sync>,
}

impl std::fmt::Debug for Perturber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Perturber")
    }
}

impl Perturber {
    pub fn new(
        inspector: Option<Arc<dyn Inspector + Send + Sync>>,
    ) -> Result<Self, ConfigError> {
        let inspector = inspector.ok_or(ConfigError::CInspectorNil)?;
        Ok(Self { inspector })
    }

    fn perturb_instance(
        &self,
        rng: &mut StdRng,
        plan_mutation: &crate::mutation::Config,
        inst: &mut Instance,
    ) -> Result<(), StageError> {
        let compiler = &inst.compiler;

        let mut marches = self.inspector.default_marches(compiler)?;
        if let Some(selection) = &compiler.march {
            marches = selection.apply(&marches);
        }
        inst.selected_march = marches.iter().choose(rng).cloned();

        let defaults = self.inspector.default_opt_levels(compiler)?;
        let all = self.inspector.opt_levels(compiler)?;
        let levels = match &compiler.opt {
            Some(selection) => selection.apply_levels(&defaults, &all),
            None => defaults,
        };
        inst.selected_opt = levels
            .iter()
            .choose(rng)
            .map(|(name, level)| optlevel::Named {
                name: name.clone(),
                level: *level,
            });

        inst.config_time = Some(Utc::now());

        inst.mutant = match (&plan_mutation.range, plan_mutation.enabled) {
            (Some(range), true) if !range.is_empty() => {
                Some(rng.random_range(range.start..range.end))
            }
            _ => None,
        };
        Ok(())
    }
}

impl StageRunner for Perturber {
    fn stage(&self) -> Stage {
        Stage::Perturb
    }

    fn run(&mut self, ctx: &Context, mut plan: Plan) -> Result<Plan, StageError> {
        let start = Instant::now();
        plan.check()?;
        ctx.check()?;

        let mut rng = plan.rng();
        let mutation = plan.mutation.clone();
        for (cid, inst) in plan.compilers.iter_mut() {
            self.perturb_instance(&mut rng, &mutation, inst)?;
            debug!(compiler = %cid, instance = %inst, "perturbed compiler");
        }

        confirm(&mut plan, Stage::Perturb, start)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::{
        id::id,
        mutation::{Config, MutantRange},
        plan::mock,
        service::compiler::{Compiler, InspectError, optlevel::Level},
    };

    struct TableInspector;

    impl Inspector for TableInspector {
        fn default_opt_levels(
            &self,
            _compiler: &Compiler,
        ) -> Result<BTreeMap<String, Level>, InspectError> {
            Ok([
                ("0".to_owned(), Level::default()),
                (
                    "3".to_owned(),
                    Level {
                        optimises: true,
                        ..Level::default()
                    },
                ),
            ]
            .into())
        }

        fn opt_levels(
            &self,
            compiler: &Compiler,
        ) -> Result<BTreeMap<String, Level>, InspectError> {
            self.default_opt_levels(compiler)
        }

        fn default_marches(&self, _compiler: &Compiler) -> Result<BTreeSet<String>, InspectError> {
            Ok(["native".to_owned(), "skylake".to_owned()].into())
        }
    }

    #[test]
    fn missing_inspector_is_a_config_error() {
        assert_eq!(
            Perturber::new(None).unwrap_err(),
            ConfigError::CInspectorNil
        );
    }

    #[test]
    fn perturb_fills_every_instance() {
        let mut stage = Perturber::new(Some(Arc::new(TableInspector))).unwrap();
        let plan = stage.run(&Context::background(), mock::plan()).unwrap();

        assert!(plan.metadata.has_stage(Stage::Perturb));
        for inst in plan.compilers.values() {
            let march = inst.selected_march.as_deref().unwrap();
            assert!(["native", "skylake"].contains(&march));
            let opt = inst.selected_opt.as_ref().unwrap();
            assert!(["0", "3"].contains(&opt.name.as_str()));
            assert!(inst.config_time.is_some());
            assert!(inst.mutant.is_none());
        }
    }

    #[test]
    fn perturb_is_reproducible_for_a_seed() {
        let mut a = Perturber::new(Some(Arc::new(TableInspector))).unwrap();
        let mut b = Perturber::new(Some(Arc::new(TableInspector))).unwrap();
        let pa = a.run(&Context::background(), mock::plan()).unwrap();
        let pb = b.run(&Context::background(), mock::plan()).unwrap();
        let ia = pa.compilers.get(&id("gcc")).unwrap();
        let ib = pb.compilers.get(&id("gcc")).unwrap();
        assert_eq!(ia.selected_march, ib.selected_march);
        assert_eq!(ia.selected_opt, ib.selected_opt);
    }

    #[test]
    fn mutants_drawn_from_configured_range() {
        let mut stage = Perturber::new(Some(Arc::new(TableInspector))).unwrap();
        let mut plan = mock::plan();
        plan.mutation = Config {
            enabled: true,
            range: Some(MutantRange { start: 10, end: 20 }),
        };
        let plan = stage.run(&Context::background(), plan).unwrap();
        for inst in plan.compilers.values() {
            let mutant = inst.mutant.unwrap();
            assert!((10..20).contains(&mutant));
        }
    }
}
