//! Scenario runner implementation
//!
//! Drives one scenario through Setup -> Action -> Assertion -> Teardown.
//! Setup failures jump straight to teardown; anything that goes wrong in the
//! action phase is reported and skipped. Teardown runs no matter how the
//! earlier phases ended, including on interrupt.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{ClientHandle, ClientSpec};
use crate::common::config::Config;
use crate::common::paths::{PortAllocator, RunDir};
use crate::common::{Error, Result};
use crate::facts::{Fact, Pattern, Snapshot};
use crate::report::{Phase, RunEvent, Reporter};
use crate::scoring::{AssertionScorer, ScenarioResult};
use crate::sequencer::{CommandSequencer, Delivery, OperationClass, SettlePolicy};
use crate::teardown::TeardownManager;

use super::bindings::Bindings;
use super::checks::{evaluate, Checkpoint, Observed, SentMessage};
use super::config::{Scenario, Step};

/// Fastest rate at which `await_text` re-reads a log
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs scenarios against one engine executable
pub struct ScenarioRunner {
    config: Config,
    engine: PathBuf,
    policy: SettlePolicy,
    teardown: TeardownManager,
}

impl ScenarioRunner {
    /// Resolve the engine and build the timing policy from `config`
    pub fn new(config: Config) -> Result<Self> {
        let engine = config.engine_path()?;
        let engine = engine.canonicalize().unwrap_or(engine);
        tracing::debug!(engine = %engine.display(), "Resolved engine executable");
        Ok(Self {
            policy: SettlePolicy::new(config.settle.clone()),
            teardown: TeardownManager::new(config.grace()),
            engine,
            config,
        })
    }

    pub fn engine(&self) -> &Path {
        &self.engine
    }

    /// Run a scenario to completion
    ///
    /// Resolving `shutdown` stops the scenario at its next suspension point;
    /// the engines are still torn down and the result is marked interrupted.
    /// Errors are only returned for problems before any engine is started.
    pub async fn run(
        &self,
        scenario: &Scenario,
        reporter: &mut dyn Reporter,
        shutdown: impl Future<Output = ()>,
    ) -> Result<ScenarioResult> {
        let run_dir = RunDir::prepare(&self.config.workspace.root, &scenario.name)?;
        reporter.emit(&RunEvent::ScenarioStarted {
            scenario: scenario.name.clone(),
            description: scenario.description.clone(),
            participants: scenario.participant_names().iter().map(|s| s.to_string()).collect(),
            run_dir: run_dir.path().display().to_string(),
        });

        let mut run = Run {
            scenario,
            policy: &self.policy,
            reporter,
            clients: Vec::with_capacity(scenario.participants.len()),
            ports: PortAllocator::new(self.config.workspace.base_port),
            sequencer: CommandSequencer::new(),
            bindings: Bindings::new(),
            messages: Vec::new(),
            checkpoints: HashMap::new(),
            scorer: AssertionScorer::new(&scenario.name),
        };

        let outcome = tokio::select! {
            outcome = run.execute(self, &run_dir) => Some(outcome),
            _ = shutdown => None,
        };
        if outcome.is_none() {
            tracing::warn!(scenario = %scenario.name, "Interrupted");
            run.reporter.emit(&RunEvent::Interrupted);
        }

        run.reporter.emit(&RunEvent::PhaseStarted {
            phase: Phase::Teardown,
        });
        let report = self.teardown.teardown_all(&mut run.clients).await;
        run.reporter.emit(&RunEvent::TeardownFinished { report });

        let Run {
            scorer, reporter, ..
        } = run;
        let result = match outcome {
            Some(Outcome::Completed) => scorer.finalize(scenario.threshold),
            Some(Outcome::SetupFailed(reason)) => scorer.aborted(scenario.threshold, reason),
            None => scorer.interrupted(scenario.threshold),
        };
        tracing::info!(
            scenario = %result.scenario,
            score = %result.score(),
            verdict = %result.verdict,
            "Scenario finished"
        );
        reporter.emit(&RunEvent::ScenarioFinished {
            result: result.clone(),
        });
        Ok(result)
    }
}

enum Outcome {
    Completed,
    SetupFailed(String),
}

/// Why a step could not complete
type StepResult = std::result::Result<(), String>;

/// Mutable state of one scenario run
struct Run<'a> {
    scenario: &'a Scenario,
    policy: &'a SettlePolicy,
    reporter: &'a mut dyn Reporter,
    clients: Vec<ClientHandle>,
    /// Port reservations, released only after teardown
    ports: PortAllocator,
    sequencer: CommandSequencer,
    bindings: Bindings,
    messages: Vec<SentMessage>,
    checkpoints: HashMap<String, Checkpoint>,
    scorer: AssertionScorer,
}

impl Run<'_> {
    async fn execute(&mut self, runner: &ScenarioRunner, run_dir: &RunDir) -> Outcome {
        self.reporter.emit(&RunEvent::PhaseStarted {
            phase: Phase::Setup,
        });
        if let Err(e) = self.launch(runner, run_dir).await {
            return self.setup_failed(e);
        }

        let scenario = self.scenario;
        for (i, step) in scenario.setup.iter().enumerate() {
            self.announce(Phase::Setup, i + 1, step);
            if let Err(reason) = self.step(step).await {
                return self.setup_failed(Error::setup_failure(i + 1, reason));
            }
        }

        self.reporter.emit(&RunEvent::PhaseStarted {
            phase: Phase::Action,
        });
        for (i, step) in scenario.actions.iter().enumerate() {
            self.announce(Phase::Action, i + 1, step);
            if let Err(reason) = self.step(step).await {
                tracing::warn!(step = i + 1, "Skipped: {reason}");
                self.reporter.emit(&RunEvent::StepSkipped {
                    index: i + 1,
                    reason,
                });
            }
        }

        self.reporter.emit(&RunEvent::PhaseStarted {
            phase: Phase::Assertion,
        });
        self.assert_all();
        Outcome::Completed
    }

    fn setup_failed(&mut self, error: Error) -> Outcome {
        tracing::error!("{error}");
        let reason = error.to_string();
        self.reporter.emit(&RunEvent::SetupFailed {
            reason: reason.clone(),
        });
        Outcome::SetupFailed(reason)
    }

    fn announce(&mut self, phase: Phase, index: usize, step: &Step) {
        self.reporter.emit(&RunEvent::Step {
            phase,
            index,
            description: step.describe(),
        });
    }

    /// Start every engine, then give them one shared warm-up
    async fn launch(&mut self, runner: &ScenarioRunner, run_dir: &RunDir) -> Result<()> {
        for participant in &self.scenario.participants {
            let port = self.ports.allocate()?;
            let files = run_dir.participant(&participant.name);
            let client = ClientHandle::spawn(ClientSpec {
                name: participant.name.clone(),
                executable: runner.engine.clone(),
                account: files.account,
                port,
                log: files.log,
                work_dir: run_dir.path().to_path_buf(),
                extra_args: runner.config.engine.extra_args.clone(),
            })?;
            self.bindings.bind(format!("{}.port", participant.name), port.to_string());
            self.clients.push(client);
        }

        self.pause("Engines warming up", runner.config.warmup()).await;

        for client in &mut self.clients {
            client.confirm_running()?;
            self.reporter.emit(&RunEvent::ClientStarted {
                client: client.name().to_string(),
                port: client.port(),
                pid: client.pid(),
            });
        }
        Ok(())
    }

    async fn step(&mut self, step: &Step) -> StepResult {
        match step {
            Step::PublishKeys { who } => {
                let names: Vec<String> = match who {
                    Some(who) => who.clone(),
                    None => self.clients.iter().map(|c| c.name().to_string()).collect(),
                };
                for name in names {
                    self.issue_class(&name, "keypackage publish", OperationClass::Network)
                        .await;
                }
                Ok(())
            }

            Step::CreateSpace {
                by,
                name,
                mode,
                bind,
                resolve_full,
            } => {
                let command = match mode {
                    Some(mode) => format!("space create {name} --mode {mode}"),
                    None => format!("space create {name}"),
                };
                self.issue_class(by, &command, OperationClass::Network).await;
                let id = self.require(by, Fact::SpaceId, Some(name.as_str()))?;
                self.bind(bind, id);
                if *resolve_full {
                    self.issue_class(by, "context", OperationClass::Query).await;
                    let full = self.require(by, Fact::FullSpaceId, None)?;
                    self.bind(&format!("full_{bind}"), full);
                }
                Ok(())
            }

            Step::CreateInvite { by, bind } => {
                self.issue_class(by, "invite create", OperationClass::Network)
                    .await;
                let code = self.require(by, Fact::InviteCode, None)?;
                self.bind(bind, code);
                Ok(())
            }

            Step::PeerInfo { who } => {
                self.issue_class(who, "network", OperationClass::Query).await;
                let peer = self.require(who, Fact::PeerId, None)?;
                self.bind(&format!("{who}.peer_id"), peer.clone());
                self.bind("peer_id", peer);
                Ok(())
            }

            Step::Join {
                who,
                via,
                space,
                invite,
            } => {
                let port = self.client(via)?.port();
                let peer = self.var(&format!("{via}.peer_id"))?;
                let space = self.var(space)?;
                let invite = self.var(invite)?;
                self.issue_class(
                    who,
                    &format!("connect /ip4/127.0.0.1/tcp/{port}/p2p/{peer}"),
                    OperationClass::Network,
                )
                .await;
                self.issue_class(who, &format!("join {space} {invite}"), OperationClass::Network)
                    .await;
                self.issue_class(who, "whoami", OperationClass::Query).await;
                let user = self.require(who, Fact::UserId, None)?;
                self.bind(&format!("{who}.user_id"), user);
                Ok(())
            }

            Step::AddMember { by, member } => {
                let user = self.var(&format!("{member}.user_id"))?;
                self.issue_class(by, &format!("member add {user}"), OperationClass::Membership)
                    .await;
                Ok(())
            }

            Step::Kick { by, member } => {
                let user = self.var(&format!("{member}.user_id"))?;
                self.issue_class(by, &format!("kick {user}"), OperationClass::Membership)
                    .await;
                Ok(())
            }

            Step::CreateChannel { by, name, bind } => {
                self.issue_class(by, &format!("channel create {name}"), OperationClass::Network)
                    .await;
                if let Some(bind) = bind {
                    let id = self.require(by, Fact::ChannelCreated, Some(name.as_str()))?;
                    self.bind(bind, id);
                }
                Ok(())
            }

            Step::CreateThread { by, title, bind } => {
                self.issue_class(
                    by,
                    &format!("thread create \"{title}\""),
                    OperationClass::Network,
                )
                .await;
                if let Some(bind) = bind {
                    let id = self.require(by, Fact::ThreadCreated, Some(title.as_str()))?;
                    self.bind(bind, id);
                }
                Ok(())
            }

            Step::Navigate {
                who,
                space,
                channel,
                thread,
            } => {
                let space = self.var(space)?;
                self.issue_class(who, &format!("space {space}"), OperationClass::Query)
                    .await;
                self.issue_class(who, "channels", OperationClass::Query).await;
                let channel_id = self.require(who, Fact::ChannelRow, Some(channel.as_str()))?;
                self.issue_class(who, &format!("channel {channel_id}"), OperationClass::Query)
                    .await;
                if let Some(thread) = thread {
                    self.issue_class(who, "threads", OperationClass::Query).await;
                    let thread_id = self.require(who, Fact::ThreadRow, Some(thread.as_str()))?;
                    self.issue_class(who, &format!("thread {thread_id}"), OperationClass::Query)
                        .await;
                }
                Ok(())
            }

            Step::Send { who, text, scope } => {
                let text = self.render(text)?;
                let settle = self.policy.propagation(self.clients.len());
                let delivery = self.issue(who, &format!("send {text}"), settle).await;
                // Undelivered messages can't be expected anywhere
                if delivery.is_delivered() {
                    self.messages.push(SentMessage {
                        seq: self.messages.len() + 1,
                        sender: who.clone(),
                        text,
                        scope: scope.clone(),
                    });
                }
                Ok(())
            }

            Step::Command {
                who,
                command,
                class,
                settle,
            } => {
                let command = self.render(command)?;
                match settle {
                    Some(secs) => {
                        let settle = self.policy.scaled(*secs);
                        self.issue(who, &command, settle).await;
                    }
                    None => {
                        self.issue_class(who, &command, *class).await;
                    }
                }
                Ok(())
            }

            Step::Extract {
                who,
                fact,
                arg,
                bind,
                required,
            } => {
                let arg = arg.as_deref().map(|a| self.render(a)).transpose()?;
                match self.extract(who, *fact, arg.as_deref())? {
                    Some(value) => self.bind(bind, value),
                    None if *required => return Err(format!("{who}: no {fact} in output")),
                    None => tracing::debug!(client = %who, fact = %fact, "Optional fact absent"),
                }
                Ok(())
            }

            Step::Wait { seconds, reason } => {
                let label = reason.as_deref().unwrap_or("Waiting");
                self.pause(label, self.policy.scaled(*seconds)).await;
                Ok(())
            }

            Step::AwaitText {
                who,
                contains,
                timeout,
            } => {
                let text = self.render(contains)?;
                let pattern =
                    Pattern::custom(&regex::escape(&text)).map_err(|e| e.to_string())?;
                let timeout = self.policy.scaled(*timeout);
                let poll = (timeout / 20).max(MIN_POLL_INTERVAL);

                let client = self
                    .clients
                    .iter_mut()
                    .find(|c| c.name() == who)
                    .ok_or_else(|| Error::UnknownParticipant(who.clone()).to_string())?;
                self.reporter
                    .emit(&RunEvent::wait(format!("Waiting for {who} to see \"{text}\""), timeout));
                let seen = self
                    .sequencer
                    .await_match(client, &pattern, timeout, poll)
                    .await;
                self.reporter.emit(&RunEvent::WaitFinished);

                if seen {
                    Ok(())
                } else {
                    Err(format!(
                        "{who} did not see \"{text}\" within {:.1}s",
                        timeout.as_secs_f64()
                    ))
                }
            }

            Step::Checkpoint { name } => {
                let mut decrypts = HashMap::new();
                for client in &self.clients {
                    let count = match client.snapshot() {
                        Ok(snapshot) => snapshot.decrypt_count(),
                        Err(e) => {
                            tracing::warn!(client = %client.name(), "{e}");
                            0
                        }
                    };
                    decrypts.insert(client.name().to_string(), count);
                }
                tracing::debug!(checkpoint = %name, messages = self.messages.len(), ?decrypts, "Checkpoint");
                self.checkpoints.insert(
                    name.clone(),
                    Checkpoint {
                        messages: self.messages.len(),
                        decrypts,
                    },
                );
                Ok(())
            }
        }
    }

    /// Evaluate and record every assertion against final snapshots
    fn assert_all(&mut self) {
        let mut snapshots = HashMap::new();
        for client in &self.clients {
            match client.snapshot() {
                Ok(snapshot) => {
                    snapshots.insert(client.name().to_string(), snapshot);
                }
                Err(e) => tracing::warn!(client = %client.name(), "{e}"),
            }
        }
        let observed = Observed {
            snapshots: &snapshots,
            messages: &self.messages,
            checkpoints: &self.checkpoints,
            bindings: &self.bindings,
        };
        for assertion in &self.scenario.assertions {
            let outcome = evaluate(&assertion.check, &observed);
            tracing::debug!(assertion = %assertion.name, passed = outcome.passed, "Evaluated");
            self.reporter.emit(&RunEvent::AssertionEvaluated {
                description: assertion.name.clone(),
                passed: outcome.passed,
                detail: outcome.detail.clone(),
            });
            self.scorer
                .record(assertion.name.clone(), outcome.passed, outcome.detail);
        }
    }

    /// Send one command and hold for `settle`
    async fn issue(&mut self, who: &str, command: &str, settle: Duration) -> Delivery {
        let Some(client) = self.clients.iter_mut().find(|c| c.name() == who) else {
            return Delivery::Failed {
                reason: Error::UnknownParticipant(who.to_string()).to_string(),
            };
        };
        self.reporter.emit(&RunEvent::CommandIssued {
            client: who.to_string(),
            command: command.to_string(),
        });
        let waiting = !settle.is_zero();
        if waiting {
            self.reporter
                .emit(&RunEvent::wait(format!("{who}: {command}"), settle));
        }
        let delivery = self.sequencer.run(client, command, settle).await;
        if waiting {
            self.reporter.emit(&RunEvent::WaitFinished);
        }
        if let Delivery::Failed { reason } = &delivery {
            self.reporter.emit(&RunEvent::CommandFailed {
                client: who.to_string(),
                command: command.to_string(),
                reason: reason.clone(),
            });
        }
        delivery
    }

    /// Send with the class's settle, plus its follow-up wait when delivered
    async fn issue_class(&mut self, who: &str, command: &str, class: OperationClass) -> Delivery {
        let delivery = self.issue(who, command, self.policy.settle(class)).await;
        if delivery.is_delivered() {
            if let Some(followup) = self.policy.followup(class) {
                self.pause("Waiting for key rotation to propagate", followup)
                    .await;
            }
        }
        delivery
    }

    async fn pause(&mut self, label: &str, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        self.reporter.emit(&RunEvent::wait(label, duration));
        tokio::time::sleep(duration).await;
        self.reporter.emit(&RunEvent::WaitFinished);
    }

    fn client(&self, who: &str) -> std::result::Result<&ClientHandle, String> {
        self.clients
            .iter()
            .find(|c| c.name() == who)
            .ok_or_else(|| Error::UnknownParticipant(who.to_string()).to_string())
    }

    fn snapshot(&self, who: &str) -> std::result::Result<Snapshot, String> {
        self.client(who)?.snapshot().map_err(|e| e.to_string())
    }

    fn extract(
        &self,
        who: &str,
        fact: Fact,
        arg: Option<&str>,
    ) -> std::result::Result<Option<String>, String> {
        let pattern = fact.pattern(arg).map_err(|e| e.to_string())?;
        let snapshot = self.snapshot(who)?;
        Ok(pattern.extract_one(&snapshot))
    }

    /// Extract a fact the step can't do without
    fn require(
        &self,
        who: &str,
        fact: Fact,
        arg: Option<&str>,
    ) -> std::result::Result<String, String> {
        self.extract(who, fact, arg)?.ok_or_else(|| match arg {
            Some(arg) => format!("{who}: no {fact} for '{arg}' in output"),
            None => format!("{who}: no {fact} in output"),
        })
    }

    fn var(&self, name: &str) -> std::result::Result<String, String> {
        self.bindings
            .require(name)
            .map(str::to_string)
            .map_err(|e| e.to_string())
    }

    fn render(&self, template: &str) -> std::result::Result<String, String> {
        self.bindings.render(template).map_err(|e| e.to_string())
    }

    fn bind(&mut self, name: &str, value: String) {
        tracing::debug!(name = %name, value = %value, "Bound");
        self.reporter.emit(&RunEvent::FactBound {
            name: name.to_string(),
            value: value.clone(),
        });
        self.bindings.bind(name, value);
    }
}
