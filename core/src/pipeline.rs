//! The pipeline engine — the heart of the decision intelligence core.
//!
//! STAGE ORDER (fixed, documented, never reordered):
//!   1. aggregate      — raw rows -> unified metric rows
//!   2. attribution    — order revenue -> per-channel credit
//!   3. mmm            — regression fit over the lookback window
//!   4. disagreement   — attribution share vs. MMM share
//!   5. signals        — rules + anomaly flags -> raw signals
//!   6. insights       — reason, score, suppress, persist lifecycle rows
//!
//! RULES:
//!   - The run context is passed explicitly; no stage reads globals.
//!   - DataGap and ModelDivergence degrade locally. Any other error
//!     marks the run failed with stage and progress context.
//!   - Attribution batches and insight persistence are transactional:
//!     a cancelled or crashed run leaves no partial batch.
//!   - The insight stage serializes per entity so cooldown always sees
//!     the latest suppression state.

use crate::aggregator;
use crate::attribution::{
    self, AttributionInput, AttributionModel, MarkovRemoval, WeightedCredit,
};
use crate::config::{EngineConfig, RuleDef};
use crate::context::RunContext;
use crate::disagreement;
use crate::error::{EngineError, EngineResult};
use crate::event::{event_type_name, EngineEvent, EventLogEntry};
use crate::lifecycle::{DecisionRecord, DecisionStatus};
use crate::mmm::{self, MmmFit};
use crate::reasoner::{self, Insight};
use crate::signals;
use crate::source::with_retry;
use crate::store::EngineStore;
use crate::suppressor::{self, Verdict};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeSet;
use std::time::Instant;
use uuid::Uuid;

pub struct PipelineEngine {
    pub store: EngineStore,
    pub config: EngineConfig,
    pub rules: Vec<RuleDef>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub entities_processed: usize,
    pub metric_rows_written: usize,
    pub orders_allocated: usize,
    pub signals: usize,
    pub insights_emitted: usize,
    pub insights_suppressed: usize,
    pub mmm_low_confidence: bool,
    pub disagreement_score: f64,
    pub instability_flagged: bool,
}

impl PipelineEngine {
    pub fn new(store: EngineStore, config: EngineConfig, rules: Vec<RuleDef>) -> Self {
        Self {
            store,
            config,
            rules,
        }
    }

    /// In-memory engine with default config and rules. Used in tests.
    pub fn build_test() -> EngineResult<Self> {
        let store = EngineStore::in_memory()?;
        store.migrate()?;
        Ok(Self::new(
            store,
            EngineConfig::default(),
            crate::config::default_rules(),
        ))
    }

    /// Register a run and build its context. The run_id threads through
    /// every stage explicitly.
    pub fn start_run(
        &self,
        seed: u64,
        as_of: NaiveDate,
        now: DateTime<Utc>,
    ) -> EngineResult<RunContext> {
        let run_id = format!("run-{}", Uuid::new_v4());
        let lookback = self.config.mmm_lookback_days;
        self.store
            .insert_run(&run_id, seed, env!("CARGO_PKG_VERSION"), as_of, lookback, now)?;
        let ctx = RunContext::new(run_id, as_of, lookback, now);
        self.log_event(
            &ctx,
            "run",
            &EngineEvent::RunStarted {
                run_id: ctx.run_id.clone(),
                as_of,
                lookback_days: lookback,
            },
        )?;
        Ok(ctx)
    }

    /// Execute the full pipeline for a run. `incremental_cutoff`
    /// switches metric recomputation from wholesale partition
    /// replacement to replacing only rows with date >= cutoff.
    pub fn run(
        &self,
        ctx: &mut RunContext,
        incremental_cutoff: Option<NaiveDate>,
    ) -> EngineResult<RunReport> {
        let mut report = RunReport {
            run_id: ctx.run_id.clone(),
            ..Default::default()
        };
        let mut entities_total = 0usize;

        let outcome = self.run_stages(ctx, incremental_cutoff, &mut report, &mut entities_total);
        match outcome {
            Ok(()) => {
                self.store.mark_run_completed(
                    &ctx.run_id,
                    Utc::now(),
                    report.entities_processed,
                    entities_total,
                )?;
                self.log_event(
                    ctx,
                    "run",
                    &EngineEvent::RunCompleted {
                        run_id: ctx.run_id.clone(),
                        entities_processed: report.entities_processed,
                        insights_emitted: report.insights_emitted,
                        insights_suppressed: report.insights_suppressed,
                    },
                )?;
                log::info!(
                    "run {} completed: {} entities, {} insights emitted, {} suppressed",
                    ctx.run_id,
                    report.entities_processed,
                    report.insights_emitted,
                    report.insights_suppressed
                );
                Ok(report)
            }
            Err((stage, e)) => {
                let message = e.to_string();
                self.store.mark_run_failed(
                    &ctx.run_id,
                    &stage,
                    &message,
                    report.entities_processed,
                    entities_total,
                    Utc::now(),
                )?;
                let _ = self.log_event(
                    ctx,
                    "run",
                    &EngineEvent::RunFailed {
                        run_id: ctx.run_id.clone(),
                        stage: stage.clone(),
                        error: message,
                        entities_processed: report.entities_processed,
                        entities_total,
                    },
                );
                log::error!("run {} failed at stage {stage}: {e}", ctx.run_id);
                Err(e)
            }
        }
    }

    fn run_stages(
        &self,
        ctx: &mut RunContext,
        incremental_cutoff: Option<NaiveDate>,
        report: &mut RunReport,
        entities_total: &mut usize,
    ) -> Result<(), (String, EngineError)> {
        let tag = |stage: &'static str| move |e: EngineError| (stage.to_string(), e);

        self.stage_aggregate(ctx, incremental_cutoff, report, entities_total)
            .map_err(tag("aggregate"))?;
        self.stage_attribution(ctx, report)
            .map_err(tag("attribution"))?;
        let (fit, dataset) = self.stage_mmm(ctx, report).map_err(tag("mmm"))?;
        self.stage_disagreement(ctx, &fit, &dataset, report)
            .map_err(tag("disagreement"))?;
        let (all_signals, windows) = self.stage_signals(ctx, report).map_err(tag("signals"))?;
        self.stage_insights(ctx, &all_signals, &windows, &fit, report)
            .map_err(tag("insights"))?;
        Ok(())
    }

    // ── Stage 1: aggregate ─────────────────────────────────────

    fn stage_aggregate(
        &self,
        ctx: &RunContext,
        incremental_cutoff: Option<NaiveDate>,
        report: &mut RunReport,
        entities_total: &mut usize,
    ) -> EngineResult<()> {
        let started = Instant::now();
        let raw = with_retry("raw_metric_daily", &self.config, || {
            self.store
                .raw_metrics_window(ctx.window_start(), ctx.as_of)
        })?;

        let rows = aggregator::aggregate(&raw);
        let entities: BTreeSet<String> = rows.iter().map(|r| r.entity_id.clone()).collect();
        *entities_total = entities.len();

        // Partition replacement is per entity; entities are independent.
        for entity in &entities {
            let entity_rows: Vec<_> = rows
                .iter()
                .filter(|r| &r.entity_id == entity)
                .cloned()
                .collect();
            self.store
                .replace_metric_partition(entity, &entity_rows, incremental_cutoff)?;
            report.entities_processed += 1;
        }
        report.metric_rows_written = rows.len();

        self.log_event(
            ctx,
            "aggregate",
            &EngineEvent::MetricsAggregated {
                run_id: ctx.run_id.clone(),
                rows_written: rows.len(),
                entities: entities.len(),
                incremental_cutoff,
            },
        )?;
        self.record_health(ctx, "aggregate", started, rows.len())?;
        Ok(())
    }

    // ── Stage 2: attribution ───────────────────────────────────

    fn stage_attribution(&self, ctx: &RunContext, report: &mut RunReport) -> EngineResult<()> {
        let started = Instant::now();
        let orders = with_retry("raw_order", &self.config, || {
            self.store.orders_window(ctx.window_start(), ctx.as_of)
        })?;
        let daily_spend = self
            .store
            .daily_spend_by_channel(ctx.window_start(), ctx.as_of)?;
        let paths = self.store.paths_window(ctx.window_start(), ctx.as_of)?;

        let input = AttributionInput {
            orders,
            daily_spend,
            paths,
        };

        // Markov only when enough touchpoint paths exist; the run
        // records which model actually produced the credit.
        let usable_paths = input.paths.iter().filter(|p| !p.channels.is_empty()).count();
        let weighted = WeightedCredit {
            window_days: self.config.attribution_window_days,
        };
        let (credits, model_used) = if usable_paths >= self.config.markov_min_paths {
            let markov = MarkovRemoval {
                min_paths: self.config.markov_min_paths,
                fallback: WeightedCredit {
                    window_days: self.config.attribution_window_days,
                },
            };
            (markov.allocate(&input)?, markov.name())
        } else {
            (weighted.allocate(&input)?, weighted.name())
        };

        let orders_allocated = credits
            .iter()
            .map(|c| c.order_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let events = attribution::to_events(&ctx.run_id, model_used, credits);
        self.store.replace_attribution_run(&ctx.run_id, &events)?;
        report.orders_allocated = orders_allocated;

        let freq = attribution::path_frequency(&input.paths);
        self.log_event(
            ctx,
            "attribution",
            &EngineEvent::AttributionComputed {
                run_id: ctx.run_id.clone(),
                model_used: model_used.to_string(),
                orders_allocated,
                path_count: usable_paths,
                path_frequency: serde_json::to_value(&freq)?,
            },
        )?;
        self.record_health(ctx, "attribution", started, events.len())?;
        Ok(())
    }

    // ── Stage 3: mmm ───────────────────────────────────────────

    fn stage_mmm(
        &self,
        ctx: &RunContext,
        report: &mut RunReport,
    ) -> EngineResult<(MmmFit, mmm::MmmDataset)> {
        let started = Instant::now();
        let mmm_start = ctx.as_of - Duration::days(self.config.mmm_lookback_days as i64 - 1);
        let dataset = self.store.mmm_dataset(mmm_start, ctx.as_of)?;

        let data_age_days = (ctx.now.date_naive() - ctx.as_of).num_days();
        let fit = match mmm::fit(&dataset, &self.config, data_age_days) {
            Ok(fit) => fit,
            Err(EngineError::DataGap { needed, got, .. }) => {
                log::warn!(
                    "mmm: insufficient history ({got} rows, {needed} needed); writing degraded fit"
                );
                mmm::degraded_fit(&dataset.channels, &self.config, dataset.len())
            }
            Err(e) => return Err(e),
        };

        self.store
            .insert_mmm_results(&ctx.run_id, &fit.channels, ctx.now)?;
        report.mmm_low_confidence = fit.low_confidence;

        let channels_fit = fit
            .channels
            .iter()
            .filter(|c| c.coefficient.is_some())
            .count();
        self.log_event(
            ctx,
            "mmm",
            &EngineEvent::MmmFitted {
                run_id: ctx.run_id.clone(),
                r_squared: fit.r_squared,
                sample_size: fit.sample_size,
                channels_fit,
                channels_dropped: fit.dropped.len(),
                low_confidence: fit.low_confidence,
            },
        )?;
        self.record_health(ctx, "mmm", started, fit.channels.len())?;
        Ok((fit, dataset))
    }

    // ── Stage 4: disagreement ──────────────────────────────────

    fn stage_disagreement(
        &self,
        ctx: &mut RunContext,
        fit: &MmmFit,
        dataset: &mmm::MmmDataset,
        report: &mut RunReport,
    ) -> EngineResult<()> {
        let started = Instant::now();
        let attribution_share = self.store.attribution_revenue_share(&ctx.run_id)?;
        let mmm_share = mmm::modeled_share(dataset, fit, &self.config);
        let summary = disagreement::compare(&attribution_share, &mmm_share, &self.config);

        report.disagreement_score = summary.score;
        report.instability_flagged = summary.instability_flagged;

        self.log_event(
            ctx,
            "disagreement",
            &EngineEvent::DisagreementEvaluated {
                run_id: ctx.run_id.clone(),
                score: summary.score,
                instability_flagged: summary.instability_flagged,
                channel_detail: serde_json::to_value(&summary.channel_alignment)?,
            },
        )?;
        self.record_health(ctx, "disagreement", started, summary.channel_alignment.len())?;
        ctx.disagreement = Some(summary);
        Ok(())
    }

    // ── Stage 5: signals ───────────────────────────────────────

    fn stage_signals(
        &self,
        ctx: &RunContext,
        report: &mut RunReport,
    ) -> EngineResult<(Vec<signals::Signal>, Vec<signals::MetricWindow>)> {
        let started = Instant::now();
        // Rules compare the recent short window against the rolling
        // baselines carried on each row, so the evaluation window is
        // the trailing week, not the whole lookback.
        let signal_start = ctx.as_of - Duration::days(aggregator::SHORT_WINDOW as i64 - 1);
        let rows = self.store.metric_rows_window(signal_start, ctx.as_of)?;
        let windows = signals::build_windows(&rows);

        let period = ctx.period();
        let mut all = signals::rule_signals(&self.rules, &windows, &period);
        let rule_count = all.len();

        let flags = self
            .store
            .anomaly_flags_window(signal_start, ctx.as_of)?;
        let anomalies = signals::anomaly_signals(&flags, &self.config, &period);
        let anomaly_count = anomalies.len();
        all.extend(anomalies);

        report.signals = all.len();
        self.log_event(
            ctx,
            "signals",
            &EngineEvent::SignalsEvaluated {
                run_id: ctx.run_id.clone(),
                rule_signals: rule_count,
                anomaly_signals: anomaly_count,
            },
        )?;
        self.record_health(ctx, "signals", started, all.len())?;
        Ok((all, windows))
    }

    // ── Stage 6: insights ──────────────────────────────────────

    fn stage_insights(
        &self,
        ctx: &RunContext,
        all_signals: &[signals::Signal],
        windows: &[signals::MetricWindow],
        fit: &MmmFit,
        report: &mut RunReport,
    ) -> EngineResult<()> {
        let started = Instant::now();
        let insights = reasoner::reason(all_signals, windows, ctx, fit.confidence, &self.config);

        // One transaction for the whole batch: either every accepted
        // insight (plus its decision row and suppression state) lands,
        // or none do.
        let tx = self.store.transaction()?;
        for insight in &insights {
            let existing = self.store.suppression_state(&insight.insight_hash)?;
            let verdict = suppressor::evaluate(insight, existing.as_ref(), ctx.now, &self.config);
            match verdict {
                Verdict::Emit => {
                    self.persist_insight(ctx, insight)?;
                    report.insights_emitted += 1;
                }
                _ => {
                    report.insights_suppressed += 1;
                    self.log_event(
                        ctx,
                        "insights",
                        &EngineEvent::InsightSuppressed {
                            run_id: ctx.run_id.clone(),
                            insight_hash: insight.insight_hash.clone(),
                            entity_id: insight.entity_id.clone(),
                            reason: verdict.reason().to_string(),
                        },
                    )?;
                }
            }
        }
        tx.commit()?;

        self.record_health(ctx, "insights", started, insights.len())?;
        Ok(())
    }

    fn persist_insight(&self, ctx: &RunContext, insight: &Insight) -> EngineResult<()> {
        self.store.upsert_insight(insight)?;
        if self
            .store
            .decision_for_insight(&insight.insight_id)?
            .is_none()
        {
            self.store.insert_decision(&DecisionRecord {
                history_id: Uuid::new_v4().to_string(),
                insight_id: insight.insight_id.clone(),
                entity_id: insight.entity_id.clone(),
                recommended_action: insight.recommendation.clone(),
                status: DecisionStatus::New,
                applied_by: None,
                applied_at: None,
                outcome_metrics_after_7d: None,
                outcome_metrics_after_30d: None,
                decision_success_score: None,
                created_at: ctx.now,
                updated_at: ctx.now,
            })?;
        }
        self.store.upsert_suppression_state(
            &insight.insight_hash,
            ctx.now,
            insight.severity,
        )?;
        self.log_event(
            ctx,
            "insights",
            &EngineEvent::InsightEmitted {
                run_id: ctx.run_id.clone(),
                insight_hash: insight.insight_hash.clone(),
                entity_id: insight.entity_id.clone(),
                insight_type: insight.insight_type.clone(),
                severity: insight.severity.as_str().to_string(),
                priority_score: insight.priority_score,
            },
        )?;
        Ok(())
    }

    // ── Outcome evaluation ─────────────────────────────────────

    /// Evaluate +7d/+30d outcomes for applied decisions. Idempotent for
    /// a fixed `now`.
    pub fn evaluate_outcomes(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        crate::lifecycle::evaluate_outcomes(&self.store, now)
    }

    // ── Internals ──────────────────────────────────────────────

    fn log_event(&self, ctx: &RunContext, stage: &str, event: &EngineEvent) -> EngineResult<()> {
        self.store.append_event(&EventLogEntry {
            id: None,
            run_id: ctx.run_id.clone(),
            stage: stage.to_string(),
            event_type: event_type_name(event).to_string(),
            payload: serde_json::to_string(event)?,
            created_at: ctx.now.to_rfc3339(),
        })
    }

    fn record_health(
        &self,
        ctx: &RunContext,
        stage: &str,
        started: Instant,
        items: usize,
    ) -> EngineResult<()> {
        self.store.insert_stage_health(
            &ctx.run_id,
            stage,
            ctx.now,
            started.elapsed().as_millis() as u64,
            items,
            0,
        )
    }
}
