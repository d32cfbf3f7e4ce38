// LEDGER PROPERTY TESTS
// Randomized lifecycles checked against the ledger's global guarantees
//
// Properties:
// - Conservation: claims + treasury == stakes + bounty + dispute stake
// - Determinism: identical inputs produce identical registry snapshots
// - Quorum rejection: insufficient voted weight always fails
// - Settlement releases every account lock

#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;
    use quorum_ledger::*;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Scenario {
        /// (stake, vote) where vote 0 = abstain, 1 = For, 2 = Against
        stakers: Vec<(Amount, u8)>,
        bounty: Amount,
        dispute_stake: Option<Amount>,
        config: SubjectConfig,
    }

    struct Settled {
        registry: SubjectRegistry,
        claimed: Amount,
        expected_in: Amount,
    }

    fn choice(vote: u8, flip: bool) -> Option<VoteChoice> {
        match (vote, flip) {
            (1, false) | (2, true) => Some(VoteChoice::For),
            (2, false) | (1, true) => Some(VoteChoice::Against),
            _ => None,
        }
    }

    fn run(scenario: &Scenario) -> Settled {
        let clock = Arc::new(ManualClock::new(1_000));
        let custody = Arc::new(InMemoryCustody::new());
        let registry = SubjectRegistry::new(scenario.config.clone(), clock.clone(), custody.clone());
        let subject = SubjectId::from("prop");

        let fund = |owner: &StakerId, amount: Amount| {
            custody.fund_wallet(owner, amount).unwrap();
            registry.deposit(owner, amount).unwrap();
        };

        let ids: Vec<StakerId> = (0..scenario.stakers.len())
            .map(|i| StakerId::new(format!("staker-{}", i)))
            .collect();
        registry.open_subject(subject.clone(), None).unwrap();
        for (id, (stake, _)) in ids.iter().zip(&scenario.stakers) {
            fund(id, *stake);
            registry.stake(&subject, id, *stake).unwrap();
        }
        let sponsor = StakerId::from("sponsor");
        if scenario.bounty > 0 {
            fund(&sponsor, scenario.bounty);
            registry.fund_bounty(&subject, &sponsor, scenario.bounty).unwrap();
        }
        registry.advance_to_voting(&subject).unwrap();

        for (id, (_, vote)) in ids.iter().zip(&scenario.stakers) {
            if let Some(choice) = choice(*vote, false) {
                // later votes may land after a fast-path resolution
                let _ = registry.cast_vote(&subject, id, choice);
            }
        }
        if registry.try_resolve(&subject).is_none() {
            clock.advance(scenario.config.voting_duration_secs);
            assert!(registry.try_resolve(&subject).is_some());
        }

        let disputer = StakerId::from("disputer");
        let mut dispute_in = 0;
        match scenario.dispute_stake {
            Some(stake) => {
                fund(&disputer, stake);
                registry.open_dispute(&subject, &disputer, stake).unwrap();
                dispute_in = stake;
                for (id, (_, vote)) in ids.iter().zip(&scenario.stakers) {
                    if let Some(choice) = choice(*vote, true) {
                        let _ = registry.cast_vote(&subject, id, choice);
                    }
                }
                clock.advance(scenario.config.voting_duration_secs);
                assert!(registry.try_resolve(&subject).is_some());
            }
            None => {
                clock.advance(scenario.config.dispute_window_secs);
                registry.close_dispute_window(&subject).unwrap();
            }
        }

        let mut claimed: Amount = 0;
        for id in ids.iter().chain([&disputer, &sponsor]) {
            if let Ok(amount) = registry.claim(&subject, id) {
                claimed += amount;
            }
        }

        let staked: Amount = scenario.stakers.iter().map(|(s, _)| s).sum();
        Settled {
            registry,
            claimed,
            expected_in: staked + scenario.bounty + dispute_in,
        }
    }

    fn scenario_strategy() -> impl Strategy<Value = Scenario> {
        (
            proptest::collection::vec((1u128..1_000u128, 0u8..3u8), 1..8),
            0u128..500u128,
            proptest::option::of(1u128..500u128),
            (1u32..8u32, 0u32..=10_000u32, 0u8..=100u8),
            (0u32..=10_000u32, 0u32..=10_000u32, any::<bool>()),
            // whole units or 18-decimal token units
            prop_oneof![Just(1u128), Just(10u128.pow(18))],
        )
            .prop_map(
                |(stakers, bounty, dispute_stake, (min_participants, min_stake_bps, supermajority_pct), (slash_bps, protocol_fee_bps, slash_idle), unit)| {
                    Scenario {
                        stakers: stakers.into_iter().map(|(stake, vote)| (stake * unit, vote)).collect(),
                        bounty: bounty * unit,
                        dispute_stake: dispute_stake.map(|stake| stake * unit),
                        config: SubjectConfig {
                            voting_duration_secs: 100,
                            min_participants,
                            min_stake_bps,
                            supermajority_pct,
                            slash_bps,
                            protocol_fee_bps,
                            min_dispute_stake: 1,
                            dispute_window_secs: 50,
                            non_voter_policy: if slash_idle {
                                NonVoterPolicy::Slash
                            } else {
                                NonVoterPolicy::Refund
                            },
                        },
                    }
                },
            )
    }

    proptest! {
        #[test]
        fn value_is_conserved(scenario in scenario_strategy()) {
            let settled = run(&scenario);
            prop_assert_eq!(
                settled.claimed + settled.registry.treasury_balance(),
                settled.expected_in
            );

            let record = settled.registry.subject_record(&SubjectId::from("prop")).unwrap();
            prop_assert!(record.pool().invariants_hold());
            prop_assert!(record.payout().unwrap().is_conserved());
            prop_assert!(record.is_fully_claimed());
        }

        #[test]
        fn settlement_releases_every_lock(scenario in scenario_strategy()) {
            let settled = run(&scenario);
            let snapshot = settled.registry.export_snapshot();
            for account in &snapshot.accounts {
                prop_assert!(!account.is_locked(), "{} still locked", account.owner());
            }
        }

        #[test]
        fn outcome_is_deterministic(scenario in scenario_strategy()) {
            let first = run(&scenario).registry.export_snapshot();
            let second = run(&scenario).registry.export_snapshot();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn quorum_shortfall_always_fails(
            total in 1u128..1_000_000_000u128,
            for_share in 0u128..=1_000u128,
            against_share in 0u128..=1_000u128,
            min_stake_bps in 0u32..=10_000u32,
            supermajority_pct in 0u8..=100u8,
        ) {
            let voted_for = total * for_share / 2_000;
            let voted_against = total * against_share / 2_000;
            let (outcome, quorum_met, _) =
                tally_outcome(total, voted_for, voted_against, min_stake_bps, supermajority_pct);

            let voted = voted_for + voted_against;
            if voted == 0 || voted * 10_000 < total * min_stake_bps as u128 {
                prop_assert_eq!(outcome, Outcome::Failed);
                prop_assert!(!quorum_met);
            } else {
                prop_assert!(quorum_met);
                prop_assert!(outcome.is_decided());
            }
        }
    }
}
