use agent_fabric::agent_fabric_collective::{
    voter_fn, ConsensusEngine, ConsensusSettings, Outcome, Proposal, Vote, VoteDecision, Voter,
};
use agent_fabric::agent_fabric_config::ConsensusAlgorithm;
use agent_fabric::agent_fabric_core::HealthStatus;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn settings(algorithm: ConsensusAlgorithm, round_timeout: Duration) -> ConsensusSettings {
    ConsensusSettings {
        algorithm,
        min_nodes: 4,
        round_timeout,
        election_timeout: Duration::from_millis(100),
    }
}

fn answers(decision: VoteDecision) -> Arc<dyn Voter> {
    Arc::new(voter_fn(move |_proposal: Proposal| async move {
        Ok(Vote::new(decision).with_rationale("scripted"))
    }))
}

fn answers_after(decision: VoteDecision, delay: Duration) -> Arc<dyn Voter> {
    Arc::new(voter_fn(move |_proposal: Proposal| async move {
        tokio::time::sleep(delay).await;
        Ok(Vote::new(decision))
    }))
}

fn hangs() -> Arc<dyn Voter> {
    Arc::new(voter_fn(|_proposal: Proposal| async {
        std::future::pending::<()>().await;
        Ok(Vote::abstain())
    }))
}

fn crashes() -> Arc<dyn Voter> {
    Arc::new(voter_fn(|_proposal: Proposal| async {
        anyhow::bail!("connection reset")
    }))
}

#[tokio::test]
async fn five_node_majority_with_one_silent_node() {
    let engine = ConsensusEngine::new(
        "coordinator",
        settings(ConsensusAlgorithm::SimpleMajority, Duration::from_millis(500)),
    );
    engine.add_voter("A", answers(VoteDecision::Accept)).await.unwrap();
    engine.add_voter("B", answers(VoteDecision::Accept)).await.unwrap();
    engine
        .add_voter("C", answers_after(VoteDecision::Accept, Duration::from_millis(20)))
        .await
        .unwrap();
    engine.add_voter("D", answers(VoteDecision::Reject)).await.unwrap();
    engine.add_voter("E", hangs()).await.unwrap();

    let report = engine
        .propose_and_wait(json!({"action": "deploy"}), None, None)
        .await
        .unwrap();

    assert_eq!(report.outcome, Outcome::Accepted);
    assert_eq!(report.tally.accepts, 3);
    assert_eq!(report.tally.rejects, 1);
    assert_eq!(report.tally.required, 3);
    assert!(report.decided_at.is_some());

    let proposal = engine.proposal(&report.proposal_id).await.unwrap();
    assert_eq!(proposal.votes.len(), 4);
    assert!(!proposal.votes.contains_key("E"));
}

#[tokio::test]
async fn byzantine_rounds_need_two_f_plus_one_of_three_f_plus_one() {
    for f in 1..=3usize {
        let n = 3 * f + 1;

        let engine = ConsensusEngine::new(
            "coordinator",
            settings(ConsensusAlgorithm::Byzantine, Duration::from_millis(500)),
        );
        for i in 0..n {
            let decision = if i < 2 * f + 1 {
                VoteDecision::Accept
            } else {
                VoteDecision::Reject
            };
            engine.add_voter(format!("n{}", i), answers(decision)).await.unwrap();
        }
        let report = engine.propose_and_wait(json!(f), None, None).await.unwrap();
        assert_eq!(report.outcome, Outcome::Accepted, "n = {}", n);
        assert_eq!(report.tally.required, 2 * f + 1);

        let engine = ConsensusEngine::new(
            "coordinator",
            settings(ConsensusAlgorithm::Byzantine, Duration::from_millis(500)),
        );
        for i in 0..n {
            let decision = if i < 2 * f {
                VoteDecision::Accept
            } else {
                VoteDecision::Reject
            };
            engine.add_voter(format!("n{}", i), answers(decision)).await.unwrap();
        }
        let report = engine.propose_and_wait(json!(f), None, None).await.unwrap();
        assert_eq!(report.outcome, Outcome::Rejected, "n = {}", n);
    }
}

#[tokio::test]
async fn byzantine_rounds_between_three_f_plus_one_sizes_need_n_minus_f() {
    // (n, accepts needed)
    for (n, needed) in [(5usize, 4usize), (6, 5)] {
        for accepts in [needed - 1, needed] {
            let engine = ConsensusEngine::new(
                "coordinator",
                settings(ConsensusAlgorithm::Byzantine, Duration::from_millis(500)),
            );
            for i in 0..n {
                let decision = if i < accepts {
                    VoteDecision::Accept
                } else {
                    VoteDecision::Reject
                };
                engine.add_voter(format!("n{}", i), answers(decision)).await.unwrap();
            }
            let report = engine.propose_and_wait(json!(n), None, None).await.unwrap();
            let expected = if accepts >= needed {
                Outcome::Accepted
            } else {
                Outcome::Rejected
            };
            assert_eq!(report.outcome, expected, "n = {}, accepts = {}", n, accepts);
            assert_eq!(report.tally.required, needed);
        }
    }
}

#[tokio::test]
async fn three_node_byzantine_round_needs_every_vote() {
    let mut small = settings(ConsensusAlgorithm::Byzantine, Duration::from_millis(500));
    small.min_nodes = 1;
    let engine = ConsensusEngine::new("coordinator", small);
    engine.add_voter("a", answers(VoteDecision::Reject)).await.unwrap();
    engine.add_voter("b", answers(VoteDecision::Reject)).await.unwrap();
    engine.add_voter("c", answers(VoteDecision::Accept)).await.unwrap();

    let report = engine.propose_and_wait(json!("x"), None, None).await.unwrap();
    assert_eq!(report.outcome, Outcome::Rejected);
    assert_eq!(report.tally.required, 3);
}

#[tokio::test]
async fn byzantine_round_below_min_nodes_is_rejected_immediately() {
    let engine = ConsensusEngine::new(
        "coordinator",
        settings(ConsensusAlgorithm::Byzantine, Duration::from_secs(10)),
    );
    for id in ["a", "b", "c", "d"] {
        engine.add_voter(id, answers(VoteDecision::Accept)).await.unwrap();
    }
    engine.mark_node("d", HealthStatus::Dead).await.unwrap();

    let started = Instant::now();
    let report = engine.propose_and_wait(json!("x"), None, None).await.unwrap();
    assert_eq!(report.outcome, Outcome::Rejected);
    assert!(report.reason.unwrap().contains("insufficient quorum"));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn every_round_ends_within_its_timeout() {
    let timeout = Duration::from_millis(100);
    let engine = ConsensusEngine::new(
        "coordinator",
        settings(ConsensusAlgorithm::SimpleMajority, timeout),
    );
    engine.add_voter("fast", answers(VoteDecision::Accept)).await.unwrap();
    engine
        .add_voter("slow", answers_after(VoteDecision::Accept, Duration::from_secs(5)))
        .await
        .unwrap();
    engine.add_voter("hung", hangs()).await.unwrap();
    engine.add_voter("broken", crashes()).await.unwrap();
    engine.add_voter("naysayer", answers(VoteDecision::Reject)).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(engine.propose(json!(i), None, None).await.unwrap());
    }

    let started = Instant::now();
    for id in &ids {
        let report = engine.await_outcome(id, timeout * 3).await.unwrap();
        assert!(report.outcome.is_decided());
    }
    assert!(started.elapsed() < timeout * 3);
}

#[tokio::test]
async fn votes_from_outside_the_electorate_do_not_count() {
    let engine = ConsensusEngine::new(
        "coordinator",
        settings(ConsensusAlgorithm::SimpleMajority, Duration::from_millis(300)),
    );
    engine.add_voter("a", hangs()).await.unwrap();
    engine.add_voter("b", hangs()).await.unwrap();
    engine.add_voter("c", hangs()).await.unwrap();

    let id = engine.propose(json!("x"), None, None).await.unwrap();
    engine.add_voter("late", answers(VoteDecision::Accept)).await.unwrap();
    assert!(engine.record_vote(&id, "late", Vote::accept()).await.is_err());

    // a later vote from the same node replaces the earlier one
    engine.record_vote(&id, "a", Vote::reject()).await.unwrap();
    engine.record_vote(&id, "a", Vote::accept()).await.unwrap();
    let outcome = engine.record_vote(&id, "b", Vote::accept()).await.unwrap();
    assert_eq!(outcome, Outcome::Accepted);

    let proposal = engine.proposal(&id).await.unwrap();
    assert_eq!(proposal.votes.len(), 2);
    assert_eq!(proposal.votes["a"].decision, VoteDecision::Accept);
}
