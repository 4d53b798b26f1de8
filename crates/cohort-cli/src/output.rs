use cohort_core::config::ExperimentConfig;
use cohort_core::orchestrator::RunSummary;
use std::path::Path;

pub fn banner(pairs: usize, config: &ExperimentConfig) {
    let t = &config.timing;
    let labels: Vec<&str> = config.intents.iter().map(|i| i.label.as_str()).collect();
    println!("{}", "=".repeat(60));
    println!("Intent experiment");
    println!("{}", "=".repeat(60));
    println!("  Cohorts:        {pairs} ({} agents each)", config.cohort_size());
    println!("  Intents:        {}", labels.join(", "));
    println!(
        "  Timeline:       {} cycles x {:.0}s = {:.1} min",
        t.total_cycles,
        t.tick_interval().as_secs_f64(),
        t.sim_duration().as_secs_f64() / 60.0
    );
    println!("  Agent timeout:  {:.0}s", t.agent_timeout().as_secs_f64());
    println!("  Simulation API: {}", config.sim.api_url);
    println!("  Model router:   {}", config.sandbox.router_url());
    println!();
}

pub fn summary(summary: &RunSummary, results_dir: &Path) {
    println!();
    println!("{}", "=".repeat(60));
    println!("Experiment {} complete", summary.experiment_id);
    println!("{}", "=".repeat(60));

    let rows = workload_rows(summary);
    if !rows.is_empty() {
        print_table(&["AGENT", "COHORT", "CITY", "STATUS", "TOKENS", "FAILURE"], rows);
        println!();
    }

    println!("  Cohorts:          {}", summary.cohorts.len());
    if summary.aborted_cohorts() > 0 {
        println!("  Aborted cohorts:  {}", summary.aborted_cohorts());
    }
    println!("  Finished:         {}", summary.completed());
    println!("  Failed:           {}", summary.failed());
    println!("  Cities with data: {}", summary.cities_with_data());
    println!("  Results:          {}", results_dir.display());
}

fn workload_rows(summary: &RunSummary) -> Vec<Vec<String>> {
    summary
        .workloads()
        .map(|w| {
            vec![
                w.agent_id.clone(),
                w.cohort.to_string(),
                w.city_id.clone(),
                w.status().to_string(),
                w.usage
                    .as_ref()
                    .map(|u| u.total_tokens.to_string())
                    .unwrap_or_else(|| "-".into()),
                w.failure.clone().unwrap_or_default(),
            ]
        })
        .collect()
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    print!("{}", render_table(headers, &rows));
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let line = |cells: Vec<String>| format!("{}\n", cells.join("  ").trim_end());

    let mut out = line(
        headers
            .iter()
            .enumerate()
            .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
            .collect(),
    );
    out.push_str(&line(widths.iter().map(|&w| "-".repeat(w)).collect()));
    for row in rows {
        out.push_str(&line(
            row.iter()
                .enumerate()
                .map(|(i, cell)| {
                    let w = widths.get(i).copied().unwrap_or(0);
                    format!("{:width$}", cell, width = w)
                })
                .collect(),
        ));
    }
    out
}
