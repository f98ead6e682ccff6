//! Asynchronous corpus assembly.
//!
//! Every stage that grows or annotates a corpus does so by sending requests
//! into a [`Builder`], which drains them sequentially and materialises the
//! updated corpus.  Workers never touch the corpus directly, so per-subject
//! work can fan out freely while insertion stays race-free.

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    id::Id,
    recipe::Recipe,
    subject::{
        CompileResult, NamedSubject, RunResult, Subject, SubjectError,
        corpus::{Corpus, CorpusError},
    },
    sync::{Context, SessionError},
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("number of builder requests must be positive")]
    BadTarget,
    #[error("requested subject name {0:?} not in builder")]
    BadName(String),
    #[error("request channel closed after {got} of {want} requests")]
    ClosedEarly { got: usize, want: usize },
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Subject(#[from] SubjectError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A single unit of corpus-building work.
///
/// Exactly one variant is populated; the builder dispatches on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Name of the subject to add or annotate.
    pub name: String,
    #[serde(flatten)]
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Body {
    /// Insert a new subject under `name`.
    Add(Subject),
    /// Attach a compile result to an existing subject.
    Compile { compiler_id: Id, result: CompileResult },
    /// Attach a lifted recipe to an existing subject.
    Recipe { arch: Id, recipe: Recipe },
    /// Attach a run result to an existing subject.
    Run { compiler_id: Id, result: RunResult },
}

impl Request {
    pub fn add(subject: NamedSubject) -> Self {
        Self {
            name: subject.name,
            body: Body::Add(subject.subject),
        }
    }

    pub fn compile(name: impl Into<String>, compiler_id: Id, result: CompileResult) -> Self {
        Self {
            name: name.into(),
            body: Body::Compile {
                compiler_id,
                result,
            },
        }
    }

    pub fn recipe(name: impl Into<String>, arch: Id, recipe: Recipe) -> Self {
        Self {
            name: name.into(),
            body: Body::Recipe { arch, recipe },
        }
    }

    pub fn run(name: impl Into<String>, compiler_id: Id, result: RunResult) -> Self {
        Self {
            name: name.into(),
            body: Body::Run {
                compiler_id,
                result,
            },
        }
    }

    /// Sends this request, giving up if `ctx` is cancelled first.
    pub fn send_to(self, ctx: &Context, tx: &Sender<Request>) -> Result<(), SessionError> {
        ctx.send_or_cancel(tx, self)
    }
}

/// Identification of a builder task, passed to observers at start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Name of the stage this builder serves.
    pub name: String,
    /// Number of requests the builder will process.
    pub nreqs: usize,
}

/// Observes a builder's lifecycle.  Callbacks for one builder are serialised.
pub trait Observer: Send + Sync {
    fn on_start(&self, _m: &Manifest) {}
    fn on_request(&self, _r: &Request) {}
    fn on_finish(&self) {}
}

/// An observer that does nothing, for when no one is listening.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentObserver;

impl Observer for SilentObserver {}

/// Configuration for a [`Builder`].
#[derive(Debug, Default)]
pub struct Config {
    /// Initial corpus; requests are applied on top of a copy of it.
    pub init: Corpus,
    /// Stage name used in the builder's manifest.
    pub name: String,
    /// Number of requests to process before returning.
    pub nreqs: usize,
}

/// Assembles a corpus from a stream of requests.
pub struct Builder<'o> {
    corpus: Corpus,
    manifest: Manifest,
    observer: &'o dyn Observer,
    rx: Receiver<Request>,
}

impl std::fmt::Debug for Builder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

impl<'o> Builder<'o> {
    /// Makes a builder and the sending end of its request channel.
    ///
    /// Fails with [`BuildError::BadTarget`] when the request target is zero.
    pub fn new(cfg: Config, observer: &'o dyn Observer) -> Result<(Self, Sender<Request>), BuildError> {
        if cfg.nreqs == 0 {
            return Err(BuildError::BadTarget);
        }
        let (tx, rx) = bounded(0);
        let b = Self {
            corpus: cfg.init,
            manifest: Manifest {
                name: cfg.name,
                nreqs: cfg.nreqs,
            },
            observer,
            rx,
        };
        Ok((b, tx))
    }

    /// Processes exactly the configured number of requests, then returns the
    /// built corpus.
    ///
    /// Returns [`SessionError::Cancelled`] (wrapped) if `ctx` ends before
    /// the requests do, and [`BuildError::ClosedEarly`] if every sender goes
    /// away first.
    pub fn run(mut self, ctx: &Context) -> Result<Corpus, BuildError> {
        self.observer.on_start(&self.manifest);
        let done = ctx.done();
        let rx = self.rx.clone();
        for got in 0..self.manifest.nreqs {
            crossbeam_channel::select! {
                recv(rx) -> msg => match msg {
                    Ok(req) => self.handle(req)?,
                    Err(_) => {
                        return Err(BuildError::ClosedEarly {
                            got,
                            want: self.manifest.nreqs,
                        });
                    }
                },
                recv(done) -> _ => return Err(SessionError::Cancelled.into()),
            }
        }
        self.observer.on_finish();
        Ok(self.corpus)
    }

    fn handle(&mut self, req: Request) -> Result<(), BuildError> {
        self.observer.on_request(&req);
        debug!(name = %req.name, "builder request");
        match req.body {
            Body::Add(subject) => Ok(self.corpus.add(req.name, subject)?),
            Body::Compile {
                compiler_id,
                result,
            } => self.amend(&req.name, |s| s.add_compile(&compiler_id, result)),
            Body::Recipe { arch, recipe } => {
                self.amend(&req.name, |s| s.add_recipe(&arch, recipe))
            }
            Body::Run {
                compiler_id,
                result,
            } => self.amend(&req.name, |s| s.add_run(&compiler_id, result)),
        }
    }

    fn amend(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Subject) -> Result<(), SubjectError>,
    ) -> Result<(), BuildError> {
        let subject = self
            .corpus
            .get_mut(name)
            .ok_or_else(|| BuildError::BadName(name.to_owned()))?;
        Ok(f(subject)?)
    }
}

/// Fans `f` out over the subjects of `src` on `nworkers` threads, funnelling
/// their requests into a builder, and returns the corpus it assembles.
///
/// The first builder error wins; otherwise the first worker error is
/// reported.  Workers observe cancellation through `ctx` and through the
/// closure of the request channel.
pub fn par_build<E, F>(
    ctx: &Context,
    nworkers: usize,
    src: &Corpus,
    cfg: Config,
    observer: &dyn Observer,
    f: F,
) -> Result<Corpus, E>
where
    E: From<BuildError> + Send,
    F: Fn(&Context, &str, &Subject, &Sender<Request>) -> Result<(), E> + Sync,
{
    let (builder, tx) = Builder::new(cfg, observer).map_err(E::from)?;
    // Zero means "pick something sensible for this machine".
    let nworkers = match nworkers {
        0 => num_cpus::get(),
        n => n,
    };
    let (work_tx, work_rx) = bounded::<(&String, &Subject)>(0);

    let (built, worker_err) = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(nworkers);
        for _ in 0..nworkers {
            let work_rx = work_rx.clone();
            let tx = tx.clone();
            let f = &f;
            handles.push(scope.spawn(move || {
                for (name, subject) in work_rx {
                    f(ctx, name, subject, &tx)?;
                }
                Ok::<_, E>(())
            }));
        }
        // The workers hold their own clones.
        drop(tx);
        drop(work_rx);

        let feeder = scope.spawn(move || {
            for item in src {
                if work_tx.send(item).is_err() {
                    break;
                }
            }
        });

        let built = builder.run(ctx);
        // If the builder bailed out early its receiver is gone, which
        // unblocks any worker mid-send and, transitively, the feeder.
        let worker_err = handles
            .into_iter()
            .filter_map(|h| h.join().ok().and_then(|r| r.err()))
            .next();
        let _ = feeder.join();
        (built, worker_err)
    });

    match (built, worker_err) {
        // A prematurely closed channel usually means a worker died first;
        // its error is the interesting one.
        (Err(BuildError::ClosedEarly { .. }), Some(we)) => Err(we),
        (Err(e), _) => Err(e.into()),
        (Ok(_), Some(we)) => Err(we),
        (Ok(corpus), None) => Ok(corpus),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::id;

    fn cfg(init: Corpus, nreqs: usize) -> Config {
        Config {
            init,
            name: "test".into(),
            nreqs,
        }
    }

    fn run_with_requests(
        init: Corpus,
        reqs: Vec<Request>,
    ) -> Result<Corpus, BuildError> {
        let (builder, tx) = Builder::new(cfg(init, reqs.len()), &SilentObserver)?;
        std::thread::scope(|scope| {
            scope.spawn(move || {
                for req in reqs {
                    if tx.send(req).is_err() {
                        break;
                    }
                }
            });
            builder.run(&Context::background())
        })
    }

    #[test]
    fn zero_target_is_rejected() {
        assert!(matches!(
            Builder::new(cfg(Corpus::new(), 0), &SilentObserver),
            Err(BuildError::BadTarget)
        ));
    }

    #[test]
    fn adds_then_annotates() {
        let reqs = vec![
            Request::add(NamedSubject {
                name: "foo".into(),
                subject: Subject::new("foo.litmus"),
            }),
            Request::compile("foo", id("gcc"), CompileResult::default()),
            Request::run("foo", id("gcc"), RunResult::default()),
            Request::recipe("foo", id("x86"), Recipe::default()),
        ];
        let corpus = run_with_requests(Corpus::new(), reqs).unwrap();
        let foo = corpus.get("foo").unwrap();
        assert!(foo.compiles.contains_key("gcc"));
        assert!(foo.runs.contains_key("gcc"));
        assert!(foo.recipes.contains_key("x86"));
    }

    #[test]
    fn duplicate_add_fails() {
        let mk = || {
            Request::add(NamedSubject {
                name: "foo".into(),
                subject: Subject::new("foo.litmus"),
            })
        };
        let err = run_with_requests(Corpus::new(), vec![mk(), mk()]).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Corpus(CorpusError::DuplicateAdd(_))
        ));
    }

    #[test]
    fn unknown_name_fails() {
        let err = run_with_requests(
            Corpus::new(),
            vec![Request::compile("nonsuch", id("gcc"), CompileResult::default())],
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::BadName(n) if n == "nonsuch"));
    }

    #[test]
    fn run_without_compile_fails() {
        let mut init = Corpus::new();
        init.add("foo", Subject::new("foo.litmus")).unwrap();
        let err = run_with_requests(
            init,
            vec![Request::run("foo", id("gcc"), RunResult::default())],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Subject(SubjectError::MissingCompile(_))
        ));
    }

    #[test]
    fn cancellation_before_first_request() {
        let (canceller, ctx) = Context::cancellable();
        let (builder, _tx) = Builder::new(cfg(Corpus::new(), 3), &SilentObserver).unwrap();
        canceller.cancel();
        let err = builder.run(&ctx).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Session(SessionError::Cancelled)
        ));
    }

    #[test]
    fn early_channel_close_is_an_error() {
        let (builder, tx) = Builder::new(cfg(Corpus::new(), 2), &SilentObserver).unwrap();
        std::thread::scope(|scope| {
            scope.spawn(move || {
                tx.send(Request::add(NamedSubject {
                    name: "foo".into(),
                    subject: Subject::default(),
                }))
                .unwrap();
                // Dropping the only sender here closes the channel.
            });
            let err = builder.run(&Context::background()).unwrap_err();
            assert!(matches!(
                err,
                BuildError::ClosedEarly { got: 1, want: 2 }
            ));
        });
    }

    #[test]
    fn request_serialises_with_flattened_body() {
        let req = Request::compile("foo", id("gcc"), CompileResult::default());
        let js = serde_json::to_value(&req).unwrap();
        assert_eq!(js["name"], "foo");
        assert_eq!(js["compile"]["compiler_id"], "gcc");
        let back: Request = serde_json::from_value(js).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn par_build_collects_worker_requests() {
        let init: Corpus = ["a", "b", "c"]
            .into_iter()
            .map(|n| (n.to_owned(), Subject::new(format!("{n}.litmus"))))
            .collect();
        let built: Result<Corpus, BuildError> = par_build(
            &Context::background(),
            4,
            &init.clone(),
            cfg(init, 3),
            &SilentObserver,
            |ctx, name, _subject, tx| {
                Request::compile(name, id("gcc"), CompileResult::default())
                    .send_to(ctx, tx)
                    .map_err(BuildError::from)
            },
        );
        let corpus = built.unwrap();
        assert_eq!(corpus.len(), 3);
        assert!(corpus.iter().all(|(_, s)| s.compiles.contains_key("gcc")));
    }
}
