//! pipeline-runner: headless runner for the decision intelligence engine.
//!
//! Usage:
//!   pipeline-runner seed-data --seed 42 --days 60 --db engine.db
//!   pipeline-runner run --db engine.db [--as-of 2025-06-30] [--incremental-days 7]
//!   pipeline-runner list-insights --db engine.db [--entity cmp-x] [--status new]
//!   pipeline-runner top-insights --db engine.db [--n 5]
//!   pipeline-runner decision-history --db engine.db --entity cmp-x
//!   pipeline-runner run-health --db engine.db --run <run_id>
//!   pipeline-runner review|apply|reject --db engine.db --insight <id> [--actor ops]
//!   pipeline-runner evaluate-outcomes --db engine.db
//!   pipeline-runner optimize --db engine.db --budget 1000
//!   pipeline-runner simulate --db engine.db --deltas meta=0.2,google=-0.1

use anyhow::{anyhow, Result};
use chrono::{NaiveDate, Utc};
use decision_core::config::{default_rules, load_rules, EngineConfig};
use decision_core::lifecycle::{self, DecisionStatus};
use decision_core::pipeline::PipelineEngine;
use decision_core::reasoner::InsightStatus;
use decision_core::sample_data;
use decision_core::store::EngineStore;
use decision_core::{optimizer, types::Channel};
use std::collections::BTreeMap;
use std::env;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    let db = str_arg(&args, "--db").unwrap_or_else(|| "engine.db".to_string());

    let store = EngineStore::open(&db)?;
    store.migrate()?;

    let config = match str_arg(&args, "--config") {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::default(),
    };
    let rules = match str_arg(&args, "--rules") {
        Some(path) => load_rules(&path)?,
        None => default_rules(),
    };
    let engine = PipelineEngine::new(store, config, rules);

    match command {
        "seed-data" => cmd_seed_data(&engine, &args),
        "run" => cmd_run(&engine, &args),
        "list-insights" => cmd_list_insights(&engine, &args),
        "top-insights" => cmd_top_insights(&engine, &args),
        "decision-history" => cmd_decision_history(&engine, &args),
        "run-health" => cmd_run_health(&engine, &args),
        "review" => cmd_transition(&engine, &args, DecisionStatus::Reviewed),
        "apply" => cmd_transition(&engine, &args, DecisionStatus::Applied),
        "verify" => cmd_transition(&engine, &args, DecisionStatus::Verified),
        "reject" => cmd_reject(&engine, &args),
        "evaluate-outcomes" => cmd_evaluate_outcomes(&engine),
        "optimize" => cmd_optimize(&engine, &args),
        "simulate" => cmd_simulate(&engine, &args),
        _ => {
            print_help();
            Ok(())
        }
    }
}

fn cmd_seed_data(engine: &PipelineEngine, args: &[String]) -> Result<()> {
    let seed = parse_arg(args, "--seed", 42u64);
    let days = parse_arg(args, "--days", 60u32);
    let end = date_arg(args, "--end").unwrap_or_else(|| Utc::now().date_naive());
    let summary = sample_data::seed_collaborator_tables(&engine.store, seed, end, days)?;
    println!(
        "seeded: {} metric rows, {} orders, {} paths, {} anomaly flags",
        summary.metric_rows, summary.orders, summary.paths, summary.anomaly_flags
    );
    Ok(())
}

fn cmd_run(engine: &PipelineEngine, args: &[String]) -> Result<()> {
    let seed = parse_arg(args, "--seed", 42u64);
    let as_of = date_arg(args, "--as-of").unwrap_or_else(|| Utc::now().date_naive());
    let incremental_cutoff = args
        .iter()
        .position(|a| a == "--incremental-days")
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse::<i64>().ok())
        .map(|d| as_of - chrono::Duration::days(d - 1));

    let mut ctx = engine.start_run(seed, as_of, Utc::now())?;
    let report = engine.run(&mut ctx, incremental_cutoff)?;

    println!("=== RUN SUMMARY ===");
    println!("  run_id:       {}", report.run_id);
    println!("  entities:     {}", report.entities_processed);
    println!("  metric rows:  {}", report.metric_rows_written);
    println!("  orders:       {}", report.orders_allocated);
    println!("  signals:      {}", report.signals);
    println!("  emitted:      {}", report.insights_emitted);
    println!("  suppressed:   {}", report.insights_suppressed);
    println!(
        "  disagreement: {:.3} (instability: {})",
        report.disagreement_score, report.instability_flagged
    );
    if report.mmm_low_confidence {
        println!("  NOTE: MMM fit is low-confidence for this run");
    }
    Ok(())
}

fn cmd_list_insights(engine: &PipelineEngine, args: &[String]) -> Result<()> {
    let entity = str_arg(args, "--entity");
    let status = str_arg(args, "--status").map(|s| InsightStatus::parse(&s));
    let limit = parse_arg(args, "--limit", 20usize);
    let offset = parse_arg(args, "--offset", 0usize);

    let insights = engine
        .store
        .list_insights(entity.as_deref(), status, limit, offset)?;
    if insights.is_empty() {
        println!("(no insights)");
        return Ok(());
    }
    for i in insights {
        let rank = i
            .rank
            .map(|r| format!("#{r}"))
            .unwrap_or_else(|| "--".to_string());
        println!(
            "{rank:>4}  [{}] {:<8} p={:.3} c={:.2}  {}  {}",
            i.status.as_str(),
            i.severity.as_str(),
            i.priority_score,
            i.confidence,
            i.entity_id,
            i.summary
        );
        println!("      id={} action: {}", i.insight_id, i.recommendation);
    }
    Ok(())
}

fn cmd_top_insights(engine: &PipelineEngine, args: &[String]) -> Result<()> {
    let n = parse_arg(args, "--n", engine.config.top_insights_n);
    for i in engine.store.top_insights(n)? {
        println!(
            "#{:<3} {:<22} {:<8} p={:.3}  {}",
            i.rank.unwrap_or(0),
            i.entity_id,
            i.severity.as_str(),
            i.priority_score,
            i.summary
        );
    }
    Ok(())
}

fn cmd_decision_history(engine: &PipelineEngine, args: &[String]) -> Result<()> {
    let entity =
        str_arg(args, "--entity").ok_or_else(|| anyhow!("--entity is required"))?;
    for d in engine.store.decision_history_for_entity(&entity)? {
        println!(
            "{}  {:<9} insight={} action: {}",
            d.created_at.format("%Y-%m-%d"),
            d.status.as_str(),
            d.insight_id,
            d.recommended_action
        );
        if let Some(score) = d.decision_success_score {
            println!("            success_score: {score:.2}");
        }
        if let Some(o) = &d.outcome_metrics_after_7d {
            println!("            outcome_7d:  {o}");
        }
        if let Some(o) = &d.outcome_metrics_after_30d {
            println!("            outcome_30d: {o}");
        }
    }
    Ok(())
}

fn cmd_run_health(engine: &PipelineEngine, args: &[String]) -> Result<()> {
    let run_id = str_arg(args, "--run").ok_or_else(|| anyhow!("--run is required"))?;
    let summary = engine.store.run_summary(&run_id)?;
    println!(
        "run {}: {} ({} / {} entities)",
        summary.run_id, summary.status, summary.entities_processed, summary.entities_total
    );
    if let Some(stage) = &summary.failed_stage {
        println!("  failed at: {stage} ({})", summary.error.as_deref().unwrap_or("?"));
    }
    for h in engine.store.stage_health_for_run(&run_id)? {
        println!(
            "  {:<14} {:>6} ms  {:>6} items  {} failures",
            h.stage, h.duration_ms, h.items_processed, h.failures
        );
    }
    Ok(())
}

fn cmd_transition(
    engine: &PipelineEngine,
    args: &[String],
    to: DecisionStatus,
) -> Result<()> {
    let insight_id =
        str_arg(args, "--insight").ok_or_else(|| anyhow!("--insight is required"))?;
    let actor = str_arg(args, "--actor").unwrap_or_else(|| "operator".to_string());
    let record = lifecycle::transition(&engine.store, &insight_id, to, &actor, Utc::now())?;
    println!(
        "decision {} -> {}",
        record.history_id,
        record.status.as_str()
    );
    Ok(())
}

fn cmd_reject(engine: &PipelineEngine, args: &[String]) -> Result<()> {
    let insight_id =
        str_arg(args, "--insight").ok_or_else(|| anyhow!("--insight is required"))?;
    lifecycle::reject_insight(&engine.store, &insight_id)?;
    println!("insight {insight_id} rejected");
    Ok(())
}

fn cmd_evaluate_outcomes(engine: &PipelineEngine) -> Result<()> {
    let updated = engine.evaluate_outcomes(Utc::now())?;
    println!("evaluated outcomes for {updated} decisions");
    Ok(())
}

fn cmd_optimize(engine: &PipelineEngine, args: &[String]) -> Result<()> {
    let budget = parse_arg(args, "--budget", 1000.0f64);
    let fit = latest_fit(engine)?;
    let current = current_spend(engine)?;
    let plan = optimizer::optimize(&fit, budget, &current, &engine.config)?;

    if !plan.stable {
        println!("fit too unstable to reallocate; keeping current spend:");
    }
    for (channel, spend) in &plan.allocations {
        println!("  {channel:<12} {spend:>10.2}");
    }
    println!("projected revenue: {:.2}", plan.projected_revenue);
    Ok(())
}

fn cmd_simulate(engine: &PipelineEngine, args: &[String]) -> Result<()> {
    let deltas_raw =
        str_arg(args, "--deltas").ok_or_else(|| anyhow!("--deltas is required"))?;
    let mut deltas: BTreeMap<Channel, f64> = BTreeMap::new();
    for part in deltas_raw.split(',') {
        let (channel, pct) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("bad delta '{part}', expected channel=pct"))?;
        deltas.insert(channel.to_string(), pct.parse()?);
    }

    let fit = latest_fit(engine)?;
    let current = current_spend(engine)?;
    let result = optimizer::simulate(&fit, &current, &deltas, &engine.config)?;
    println!("baseline revenue:  {:.2}", result.baseline_revenue);
    println!("projected revenue: {:.2}", result.projected_revenue);
    println!("projected delta:   {:+.2}", result.projected_delta);
    Ok(())
}

/// Rebuild an MmmFit view from the latest persisted MMM run.
fn latest_fit(engine: &PipelineEngine) -> Result<decision_core::mmm::MmmFit> {
    let run_id = engine
        .store
        .latest_mmm_run_id()?
        .ok_or_else(|| anyhow!("no MMM results yet; execute `run` first"))?;
    let channels = engine.store.mmm_results(&run_id)?;
    let (r_squared, sample_size) = channels
        .first()
        .map(|c| (c.r_squared, c.sample_size))
        .unwrap_or((0.0, 0));
    let low_confidence = channels.iter().any(|c| c.low_confidence);
    let dropped = channels
        .iter()
        .filter(|c| c.coefficient.is_none())
        .map(|c| c.channel.clone())
        .collect();
    let confidence = decision_core::mmm::confidence_score(r_squared, sample_size, 0);
    Ok(decision_core::mmm::MmmFit {
        channels,
        r_squared,
        sample_size,
        low_confidence,
        confidence,
        dropped,
    })
}

/// Current daily spend per channel, averaged over the trailing week.
fn current_spend(engine: &PipelineEngine) -> Result<BTreeMap<Channel, f64>> {
    let end = Utc::now().date_naive();
    let start = end - chrono::Duration::days(6);
    let mut totals: BTreeMap<Channel, f64> = BTreeMap::new();
    for s in engine.store.daily_spend_by_channel(start, end)? {
        *totals.entry(s.channel).or_insert(0.0) += s.spend / 7.0;
    }
    Ok(totals)
}

fn print_help() {
    println!("pipeline-runner — decision intelligence engine");
    println!();
    println!("commands:");
    println!("  seed-data          seed synthetic collaborator tables");
    println!("  run                execute a full pipeline run");
    println!("  list-insights      list insights (filters: --entity, --status)");
    println!("  top-insights       top-N ranked actionable insights");
    println!("  decision-history   audit trail for an entity");
    println!("  run-health         stage timings and run status");
    println!("  review|apply|verify|reject   lifecycle transitions");
    println!("  evaluate-outcomes  compute +7d/+30d outcome deltas");
    println!("  optimize           budget reallocation for --budget");
    println!("  simulate           what-if for --deltas channel=pct,...");
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn str_arg(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}

fn date_arg(args: &[String], flag: &str) -> Option<NaiveDate> {
    str_arg(args, flag).and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}
