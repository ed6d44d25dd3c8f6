use anyhow::Result;
use scaling_bench::{
    aggregate::analyze,
    extract,
    report::{render_scaling_csv, ReportWriter, STARTUP_CSV, STRONG_CSV, TEXT_REPORT, WEAK_CSV},
    results::{RawResults, ResultsManager, SessionSettings, RAW_RESULTS_FILE, RAW_STREAM_FILE},
    RunRecord, ScalingLaw, VariantOutcome, VariantStatus,
};

fn load_test_output(clients: u32, per_client: u64, throughput: f64, latency: f64) -> String {
    format!(
        "Starting load test with {clients} concurrent clients...\n\
         === Load Test Results ===\n\
         Total clients: {clients}\n\
         Messages per client: {per_client}\n\
         Total messages processed: {}\n\
         Total errors: 0\n\
         Average latency: {latency} ms\n\
         Throughput: {throughput} messages/second\n",
        u64::from(clients) * per_client
    )
}

fn run(variant: &str, law: ScalingLaw, clients: u32, per_client: u64, index: usize, output: String) -> RunRecord {
    RunRecord::new(
        variant,
        law,
        clients,
        per_client,
        index,
        true,
        extract(&output),
        output,
        None,
        10.0,
    )
}

fn settings() -> SessionSettings {
    SessionSettings {
        host: "localhost".into(),
        baseline: "jvm-local".into(),
        variants: vec!["jvm-local".into(), "gramine-sgx".into()],
        repetitions: 2,
        strong_total: 1000,
        weak_per_client: 100,
        client_counts: vec![1, 4],
    }
}

/// Client output flows through extraction, the results manager, aggregation
/// and every report artifact.
#[test]
fn raw_output_to_reports() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut manager = ResultsManager::new(dir.path())?;

    for (variant, factor) in [("jvm-local", 1.0), ("gramine-sgx", 0.5)] {
        for (clients, per_client) in [(1u32, 1000u64), (4, 250)] {
            for index in 0..2 {
                let throughput = 100.0 * f64::from(clients) * factor + index as f64 * 10.0;
                let latency = 10.0 / factor;
                manager.add_record(run(
                    variant,
                    ScalingLaw::Strong,
                    clients,
                    per_client,
                    index,
                    load_test_output(clients, per_client, throughput, latency),
                ))?;
            }
        }
        manager.add_record(run(
            variant,
            ScalingLaw::Weak,
            4,
            100,
            0,
            load_test_output(4, 100, 400.0 * factor, 10.0),
        ))?;
        manager.add_outcome(VariantOutcome {
            variant: variant.into(),
            status: VariantStatus::Completed,
            startup_time_seconds: Some(if factor < 1.0 { 45.0 } else { 1.5 }),
            run_count: 5,
        });
    }

    let raw = manager.finalize(settings())?;
    assert_eq!(raw.records.len(), 10);
    assert_eq!(
        std::fs::read_to_string(dir.path().join(RAW_STREAM_FILE))?.lines().count(),
        10
    );

    let analysis = analyze(&raw.records, &raw.outcomes, "jvm-local");
    assert_eq!(analysis.strong.len(), 4);
    assert_eq!(analysis.weak.len(), 2);

    let sgx4 = analysis
        .strong
        .iter()
        .find(|p| p.variant == "gramine-sgx" && p.num_clients == 4)
        .unwrap();
    // jvm: 400, 410 -> 405; sgx: 200, 210 -> 205
    assert_eq!(sgx4.run_count, 2);
    assert_eq!(sgx4.throughput_mean, Some(205.0));
    assert!((sgx4.speedup_throughput.unwrap() - 205.0 / 405.0).abs() < 1e-12);
    assert_eq!(sgx4.speedup_latency, Some(0.5));
    assert_eq!(sgx4.efficiency_latency, Some(0.125));

    ReportWriter::new(dir.path()).write_all(&raw, &analysis)?;
    for name in [STRONG_CSV, WEAK_CSV, STARTUP_CSV, TEXT_REPORT] {
        assert!(dir.path().join(name).exists(), "{name} was not written");
    }
    let startup = std::fs::read_to_string(dir.path().join(STARTUP_CSV))?;
    assert!(startup.contains("gramine-sgx,45.0000"));
    let report = std::fs::read_to_string(dir.path().join(TEXT_REPORT))?;
    assert!(report.contains("43.50"));

    Ok(())
}

/// Reports regenerated from the raw dump match the ones written live.
#[test]
fn reports_regenerate_from_raw_dump() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut manager = ResultsManager::new(dir.path())?;
    for index in 0..3 {
        manager.add_record(run(
            "jvm-local",
            ScalingLaw::Weak,
            2,
            100,
            index,
            load_test_output(2, 100, 150.0 + index as f64, 3.0),
        ))?;
    }
    manager.add_outcome(VariantOutcome {
        variant: "jvm-local".into(),
        status: VariantStatus::Completed,
        startup_time_seconds: Some(2.0),
        run_count: 3,
    });
    let raw = manager.finalize(settings())?;
    let live = render_scaling_csv(&analyze(&raw.records, &raw.outcomes, "jvm-local").weak, ScalingLaw::Weak);

    let reloaded = RawResults::load(&dir.path().join(RAW_RESULTS_FILE))?;
    let again = render_scaling_csv(
        &analyze(&reloaded.records, &reloaded.outcomes, "jvm-local").weak,
        ScalingLaw::Weak,
    );
    assert_eq!(live, again);
    assert!(again.contains("2,jvm-local,151.0000,1.0000,3.0000,0.0000,1.0000,1.0000,0.5000,0.5000,200"));
    Ok(())
}
