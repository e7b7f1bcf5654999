mod common;

use anyhow::Result;
use common::*;
use league_crawler::cache::lock_store;
use league_crawler::{ExploreError, FieldValue, MemorySink, PeriodState, RunOutcome};
use shared::{AnomalyKind, AnomalyPolicy, CandidateState, ConfigError, EndpointKind, Period, Quality};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_flood_fill_finds_unseeded_neighbour() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Arc::new(FakeCatalog::new().with_leagues(2019, [1001, 1003]));
    let sink = Arc::new(MemorySink::new());
    let config = test_config(temp_dir.path(), &[2019], &[1001], 2);
    let crawler = crawler(catalog.clone(), config, temp_dir.path(), sink.clone())?;

    let summary = crawler.run(CancellationToken::new()).await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.confirmed, 2);
    // 1001 and its neighbours 999..=1003, then 1004 and 1005 from 1003
    assert_eq!(summary.candidates_tested, 7);
    assert_eq!(summary.rejected, 5);
    assert_eq!(
        catalog.requested_ids(2019),
        vec![999, 1000, 1001, 1002, 1003, 1004, 1005]
    );

    let store = crawler.store();
    let store = lock_store(&store)?;
    let found = store.get_entry(1003, Period(2019))?.expect("1003 cached");
    assert_eq!(found.state, CandidateState::Confirmed);
    assert_eq!(found.quality, Quality::Complete);
    assert_eq!(found.record_count, 11);
    assert_eq!(found.display_name.as_deref(), Some("Bezirksliga 1003 (2019)"));

    let gap = store.get_entry(1002, Period(2019))?.expect("1002 cached");
    assert_eq!(gap.state, CandidateState::Rejected);

    assert_eq!(
        sink.entities(Period(2019)).map(|e| e.len()),
        Some(2 * ENTITIES_PER_LEAGUE)
    );
    Ok(())
}

#[tokio::test]
async fn test_flood_fill_converges_for_every_radius() -> Result<()> {
    let valid: Vec<i64> = (500..=512).collect();

    for radius in 1..=4 {
        let temp_dir = TempDir::new()?;
        let catalog = Arc::new(FakeCatalog::new().with_leagues(2019, valid.iter().copied()));
        let sink = Arc::new(MemorySink::new());
        let config = test_config(temp_dir.path(), &[2019], &[506], radius);
        let crawler = crawler(catalog.clone(), config, temp_dir.path(), sink.clone())?;

        let summary = crawler.run(CancellationToken::new()).await?;

        assert_eq!(summary.confirmed, valid.len(), "radius {}", radius);
        // Each coordinate is probed once, never more
        let expected_probes = valid.len() + 2 * radius as usize;
        assert_eq!(summary.candidates_tested, expected_probes, "radius {}", radius);
        assert_eq!(
            catalog.requested_ids(2019).len(),
            expected_probes,
            "radius {}",
            radius
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_flood_fill_bridges_gaps_within_radius() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let valid = [100, 103, 106, 109, 112];
    let catalog = Arc::new(FakeCatalog::new().with_leagues(2019, valid));
    let sink = Arc::new(MemorySink::new());
    let config = test_config(temp_dir.path(), &[2019], &[100], 3);
    let crawler = crawler(catalog, config, temp_dir.path(), sink)?;

    let summary = crawler.run(CancellationToken::new()).await?;
    assert_eq!(summary.confirmed, valid.len());
    assert_eq!(summary.errored, 0);
    Ok(())
}

#[tokio::test]
async fn test_second_run_is_idempotent() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001, 1003, 1004])
            .with_leagues(2020, [2001]),
    );

    let first_sink = Arc::new(MemorySink::new());
    let config = test_config(temp_dir.path(), &[2019, 2020], &[1001, 2001], 2);
    let first = crawler(catalog.clone(), config.clone(), temp_dir.path(), first_sink.clone())?
        .run(CancellationToken::new())
        .await?;
    let calls_after_first = catalog.calls();
    assert!(first.fetch_calls > 0);
    assert_eq!(first.fetch_calls, calls_after_first);

    let second_sink = Arc::new(MemorySink::new());
    let second = crawler(catalog.clone(), config, temp_dir.path(), second_sink.clone())?
        .run(CancellationToken::new())
        .await?;

    assert_eq!(catalog.calls(), calls_after_first);
    assert_eq!(second.fetch_calls, 0);
    assert_eq!(second.candidates_tested, 0);
    assert_eq!(second.confirmed, first.confirmed);
    assert_eq!(second.entities, first.entities);
    assert_eq!(
        second.period(Period(2019)).map(|p| p.replayed),
        Some(3)
    );

    for period in [Period(2019), Period(2020)] {
        assert_eq!(second_sink.entities(period), first_sink.entities(period));
    }
    Ok(())
}

#[tokio::test]
async fn test_low_entity_count_halts_run() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001])
            .with_leagues(2020, [2001]),
    );
    let sink = Arc::new(MemorySink::new());
    let mut config = test_config(temp_dir.path(), &[2019, 2020], &[1001, 2001], 1);
    config.anomaly.min_entities_per_period = 5;

    let summary = crawler(catalog.clone(), config.clone(), temp_dir.path(), sink.clone())?
        .run(CancellationToken::new())
        .await?;

    let criticals: Vec<_> = summary.anomalies.iter().filter(|e| e.is_critical()).collect();
    assert_eq!(criticals.len(), 1);
    assert_eq!(criticals[0].kind, AnomalyKind::LowEntityCount);
    assert_eq!(criticals[0].period, Some(Period(2019)));
    assert!(summary.has_critical());
    assert_eq!(summary.outcome, RunOutcome::Halted);
    assert_eq!(summary.periods.len(), 1);
    assert_eq!(summary.periods[0].state, PeriodState::Halted);

    // Halted period output is withheld and 2020 was never touched
    assert!(sink.batches().is_empty());
    assert!(catalog.requested_ids(2020).is_empty());

    // The blocking critical keeps the period from being crawled again
    let calls = catalog.calls();
    let blocked = crawler(catalog.clone(), config.clone(), temp_dir.path(), sink.clone())?
        .run(CancellationToken::new())
        .await?;
    assert_eq!(
        blocked.period(Period(2019)).map(|p| p.state),
        Some(PeriodState::Blocked)
    );
    assert!(!catalog.requested_ids(2019).is_empty());
    assert_eq!(
        catalog
            .requested()
            .iter()
            .skip(calls)
            .filter(|(_, period, _)| *period == 2019)
            .count(),
        0
    );

    // Acknowledging unblocks it
    let crawler = crawler(catalog.clone(), config, temp_dir.path(), sink)?;
    lock_store(&crawler.store())?.acknowledge_period(Period(2019))?;
    let retried = crawler.run(CancellationToken::new()).await?;
    assert_eq!(
        retried.period(Period(2019)).map(|p| p.state),
        Some(PeriodState::Halted)
    );
    Ok(())
}

#[tokio::test]
async fn test_skip_period_continues_with_next_period() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001])
            .with_leagues(2020, [2001, 2002]),
    );
    let sink = Arc::new(MemorySink::new());
    let mut config = test_config(temp_dir.path(), &[2019, 2020], &[1001, 2001], 1);
    config.anomaly.min_entities_per_period = 2;
    config.anomaly.policy = AnomalyPolicy::SkipPeriod;

    let summary = crawler(catalog, config, temp_dir.path(), sink.clone())?
        .run(CancellationToken::new())
        .await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(summary.has_critical());
    assert_eq!(sink.entities(Period(2019)), None);
    assert_eq!(
        sink.entities(Period(2020)).map(|e| e.len()),
        Some(2 * ENTITIES_PER_LEAGUE)
    );
    Ok(())
}

#[tokio::test]
async fn test_consecutive_fetch_errors_halt_period() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001])
            .with_failing((995..=1000).chain(1002..=1006)),
    );
    let sink = Arc::new(MemorySink::new());
    let mut config = test_config(temp_dir.path(), &[2019], &[1001], 5);
    config.discovery.worker_count = 1;
    config.anomaly.max_consecutive_fetch_errors = 3;

    let summary = crawler(catalog.clone(), config, temp_dir.path(), sink)?
        .run(CancellationToken::new())
        .await?;

    let criticals: Vec<_> = summary.anomalies.iter().filter(|e| e.is_critical()).collect();
    assert_eq!(criticals.len(), 1);
    assert_eq!(criticals[0].kind, AnomalyKind::FetchErrors);
    assert_eq!(summary.outcome, RunOutcome::Halted);

    // One league fully fetched, then three failing probes and nothing more
    assert_eq!(summary.fetch_calls, EndpointKind::ALL.len() + 3);
    assert_eq!(catalog.requested_ids(2019), vec![996, 997, 998, 1001]);
    assert_eq!(summary.errored, 3);
    Ok(())
}

#[tokio::test]
async fn test_not_found_is_rejected_without_retry() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001])
            .with_missing([1000, 1002]),
    );
    let sink = Arc::new(MemorySink::new());
    let mut config = test_config(temp_dir.path(), &[2019], &[1001], 1);
    config.crawler.retry.max_attempts = 3;

    let summary = crawler(catalog.clone(), config, temp_dir.path(), sink)?
        .run(CancellationToken::new())
        .await?;

    assert_eq!(summary.rejected, 2);
    assert_eq!(summary.fetch_stats.retries, 0);
    assert_eq!(catalog.calls(), EndpointKind::ALL.len() + 2);
    Ok(())
}

#[tokio::test]
async fn test_parse_failure_marks_candidate_errored() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let broken = page(
        "Bezirksliga",
        &["Platz", "Name", "Vorname", "Mannschaft", "Punkte", "Sp", "Schnitt"],
        &[vec![
            "1.".into(),
            "Müller".into(),
            "Max".into(),
            "TSV".into(),
            "3l2".into(),
            "10".into(),
            "31,2".into(),
        ]],
    );
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001, 1002])
            .with_page(1002, 2019, EndpointKind::TopScorers, broken),
    );
    let sink = Arc::new(MemorySink::new());
    let config = test_config(temp_dir.path(), &[2019], &[1001], 1);
    let crawler = crawler(catalog, config, temp_dir.path(), sink)?;

    let summary = crawler.run(CancellationToken::new()).await?;

    assert_eq!(summary.parse_failures, 1);
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.samples.len(), 1);
    assert!(summary.samples[0].contains("total_points"));
    assert!(summary
        .anomalies
        .iter()
        .any(|e| e.kind == AnomalyKind::ParseFailure && !e.is_critical()));

    let entry = lock_store(&crawler.store())?
        .get_entry(1002, Period(2019))?
        .expect("1002 cached");
    assert_eq!(entry.state, CandidateState::Errored);
    assert_eq!(entry.quality, Quality::None);
    Ok(())
}

#[tokio::test]
async fn test_partial_quality_when_secondary_endpoint_fails() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let broken_ft = page(
        "Bezirksliga",
        &["Platz", "Name", "Vorname", "Mannschaft", "Versuche", "Treffer", "Quote"],
        &[vec![
            "1".into(),
            "Müller".into(),
            "Max".into(),
            "TSV".into(),
            "vierzig".into(),
            "30".into(),
            "75,0".into(),
        ]],
    );
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001])
            .with_page(1001, 2019, EndpointKind::FreeThrows, broken_ft),
    );
    let sink = Arc::new(MemorySink::new());
    let config = test_config(temp_dir.path(), &[2019], &[1001], 1);
    let crawler = crawler(catalog, config, temp_dir.path(), sink.clone())?;

    let summary = crawler.run(CancellationToken::new()).await?;
    assert_eq!(summary.confirmed, 1);
    assert_eq!(summary.parse_failures, 1);

    let entry = lock_store(&crawler.store())?
        .get_entry(1001, Period(2019))?
        .expect("1001 cached");
    assert_eq!(entry.state, CandidateState::Confirmed);
    assert_eq!(entry.quality, Quality::Partial);
    assert_eq!(entry.record_count, 8);

    let entities = sink.entities(Period(2019)).expect("2019 emitted");
    assert!(entities
        .iter()
        .all(|e| !e.fields.contains_key("ft_percentage")));
    Ok(())
}

#[tokio::test]
async fn test_conflicting_field_keeps_first_seen_value() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let threes = page(
        "Bezirksliga",
        &["Platz", "Name", "Vorname", "Mannschaft", "Treffer", "Sp", "Schnitt"],
        &[vec![
            "1".into(),
            "Müller".into(),
            "Max".into(),
            "TSV Liga1001 A".into(),
            "15".into(),
            "11".into(),
            "1,4".into(),
        ]],
    );
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001])
            .with_page(1001, 2019, EndpointKind::ThreePointers, threes),
    );
    let sink = Arc::new(MemorySink::new());
    let config = test_config(temp_dir.path(), &[2019], &[1001], 1);

    let summary = crawler(catalog, config, temp_dir.path(), sink.clone())?
        .run(CancellationToken::new())
        .await?;

    assert_eq!(summary.identity_conflicts, 1);
    let conflicts: Vec<_> = summary
        .anomalies
        .iter()
        .filter(|e| e.kind == AnomalyKind::FieldConflict)
        .collect();
    assert_eq!(conflicts.len(), 1);
    assert!(!conflicts[0].is_critical());

    let entities = sink.entities(Period(2019)).expect("2019 emitted");
    let max = entities
        .iter()
        .find(|e| e.identity_key == "max|müller|tsv liga1001 a")
        .expect("merged player");
    assert_eq!(max.fields["games"], FieldValue::Int(10));
    assert_eq!(max.fields["threes_made"], FieldValue::Int(15));
    assert_eq!(
        max.conflicts["games"],
        vec![FieldValue::Int(10), FieldValue::Int(11)]
    );
    assert_eq!(max.contributions.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_run_fetches_nothing() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Arc::new(FakeCatalog::new().with_leagues(2019, [1001]));
    let sink = Arc::new(MemorySink::new());
    let config = test_config(temp_dir.path(), &[2019], &[1001], 1);
    let crawler = crawler(catalog.clone(), config, temp_dir.path(), sink)?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = crawler.run(cancel).await?;

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(catalog.calls(), 0);

    let sessions = lock_store(&crawler.store())?.recent_sessions(1)?;
    assert_eq!(sessions[0].outcome.as_deref(), Some("cancelled"));
    Ok(())
}

#[tokio::test]
async fn test_invalid_configuration_is_fatal() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Arc::new(FakeCatalog::new());

    let mut config = test_config(temp_dir.path(), &[2019], &[1001], 1);
    config.discovery.worker_count = 0;
    let err = crawler(catalog.clone(), config, temp_dir.path(), Arc::new(MemorySink::new()))?
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExploreError::Config(ConfigError::ZeroWorkers)));

    let config = test_config(temp_dir.path(), &[2019], &[], 1);
    let err = crawler(catalog.clone(), config, temp_dir.path(), Arc::new(MemorySink::new()))?
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExploreError::Config(ConfigError::NoSeeds(Period(2019)))));

    assert_eq!(catalog.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unrecognised_secondary_layout_downgrades_quality() -> Result<()> {
    let temp_dir = TempDir::new()?;
    // Free throw page missing the team and percentage columns
    let narrow_ft = page(
        "Bezirksliga",
        &["Platz", "Name", "Vorname", "Versuche", "Treffer"],
        &[vec![
            "1".into(),
            "Müller".into(),
            "Max".into(),
            "40".into(),
            "30".into(),
        ]],
    );
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001])
            .with_page(1001, 2019, EndpointKind::FreeThrows, narrow_ft),
    );
    let sink = Arc::new(MemorySink::new());
    let config = test_config(temp_dir.path(), &[2019], &[1001], 1);
    let crawler = crawler(catalog, config, temp_dir.path(), sink.clone())?;

    let summary = crawler.run(CancellationToken::new()).await?;
    assert_eq!(summary.confirmed, 1);
    assert_eq!(summary.parse_failures, 1);
    assert!(summary.samples[0].contains("expected layout"));
    assert!(summary
        .anomalies
        .iter()
        .any(|e| e.kind == AnomalyKind::ParseFailure && !e.is_critical()));

    let entry = lock_store(&crawler.store())?
        .get_entry(1001, Period(2019))?
        .expect("1001 cached");
    assert_eq!(entry.state, CandidateState::Confirmed);
    assert_eq!(entry.quality, Quality::Partial);
    assert_eq!(entry.record_count, 8);

    let entities = sink.entities(Period(2019)).expect("2019 emitted");
    assert!(entities.iter().all(|e| !e.fields.contains_key("ft_made")));
    Ok(())
}

#[tokio::test]
async fn test_unrecognised_standings_layout_marks_errored() -> Result<()> {
    let temp_dir = TempDir::new()?;
    // A scorer-style table where the standings are expected
    let scorers_as_standings = page(
        "Bezirksliga",
        &["Platz", "Name", "Vorname", "Punkte", "Sp", "Schnitt"],
        &[vec![
            "1.".into(),
            "Müller".into(),
            "Max".into(),
            "312".into(),
            "18".into(),
            "17,3".into(),
        ]],
    );
    let catalog = Arc::new(
        FakeCatalog::new()
            .with_leagues(2019, [1001])
            .with_page(1001, 2019, EndpointKind::Standings, scorers_as_standings),
    );
    let sink = Arc::new(MemorySink::new());
    let mut config = test_config(temp_dir.path(), &[2019], &[1001], 1);
    config.anomaly.policy = AnomalyPolicy::LogOnly;
    let crawler = crawler(catalog, config, temp_dir.path(), sink)?;

    let summary = crawler.run(CancellationToken::new()).await?;
    assert_eq!(summary.confirmed, 0);
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.parse_failures, 1);
    assert!(summary
        .anomalies
        .iter()
        .any(|e| e.kind == AnomalyKind::ParseFailure && e.candidate_id == Some(1001)));

    let entry = lock_store(&crawler.store())?
        .get_entry(1001, Period(2019))?
        .expect("1001 cached");
    assert_eq!(entry.state, CandidateState::Errored);
    Ok(())
}

#[tokio::test]
async fn test_unstored_responses_are_refetched_next_run() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let catalog = Arc::new(FakeCatalog::new().with_leagues(2019, [1001]));
    let config = test_config(temp_dir.path(), &[2019], &[1001], 1);

    // A plain file where the period's response directory belongs
    let blocker = temp_dir.path().join("responses").join("2019");
    let first_sink = Arc::new(MemorySink::new());
    let first_crawler = crawler(catalog.clone(), config.clone(), temp_dir.path(), first_sink.clone())?;
    std::fs::write(&blocker, "not a directory")?;

    let first = first_crawler.run(CancellationToken::new()).await?;
    assert_eq!(first.confirmed, 1);
    assert!(!first.has_critical());
    assert_eq!(
        first
            .anomalies
            .iter()
            .filter(|e| e.kind == AnomalyKind::ResponseCacheWrite)
            .count(),
        EndpointKind::ALL.len()
    );
    assert_eq!(
        first_sink.entities(Period(2019)).map(|e| e.len()),
        Some(ENTITIES_PER_LEAGUE)
    );

    std::fs::remove_file(&blocker)?;
    let calls_after_first = catalog.calls();

    // Nothing to replay, so the confirmed league is fetched again
    let second_sink = Arc::new(MemorySink::new());
    let second = crawler(catalog.clone(), config.clone(), temp_dir.path(), second_sink.clone())?
        .run(CancellationToken::new())
        .await?;
    assert_eq!(second.candidates_tested, 1);
    assert_eq!(second.confirmed, 1);
    assert_eq!(catalog.calls() - calls_after_first, EndpointKind::ALL.len());
    assert_eq!(second_sink.entities(Period(2019)), first_sink.entities(Period(2019)));

    // Now stored, a third run replays without fetching
    let calls_after_second = catalog.calls();
    let third_sink = Arc::new(MemorySink::new());
    let third = crawler(catalog.clone(), config, temp_dir.path(), third_sink.clone())?
        .run(CancellationToken::new())
        .await?;
    assert_eq!(catalog.calls(), calls_after_second);
    assert_eq!(third.period(Period(2019)).map(|p| p.replayed), Some(1));
    assert_eq!(third_sink.entities(Period(2019)), first_sink.entities(Period(2019)));
    Ok(())
}
