//! Staking reconciler.
//!
//! Given a fresh on-chain snapshot and a target staking program, computes
//! the transaction plan for this invocation and executes it strictly
//! sequentially. Planning is pure so every decision path is testable
//! without a chain; execution re-derives nothing, so a re-run after a
//! partial plan simply plans again from the new on-chain state.
//!
//! One invocation performs at most one state-machine step: a service
//! staked off-target is only unstaked, and staking on the target happens
//! on the next run. A service can hold one stake at a time by contract
//! design.

use alloy::primitives::{Bytes, U256};
use alloy::sol_types::SolCall;
use chrono::{TimeZone, Utc};
use trader_runtime::chain::ChainClient;
use trader_runtime::contracts::{IERC20, IStakingToken};
use trader_runtime::error::OperatorError;
use trader_runtime::types::{StakingState, TxDescriptor, TxKind, format_duration};

use crate::catalog::{NO_STAKING_PROGRAM_ID, StakingCatalog};
use crate::config::OperatorConfig;
use crate::inspector::{StakingSnapshot, collect_snapshot};

/// One planned action, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    /// Approve the service NFT for the target staking contract.
    Approve { program: String },
    /// Stake the service on a program.
    Stake { program: String },
    /// Unstake the service from a program.
    Unstake { program: String },
}

impl PlanAction {
    pub fn kind(&self) -> TxKind {
        match self {
            PlanAction::Approve { .. } => TxKind::Approve,
            PlanAction::Stake { .. } => TxKind::Stake,
            PlanAction::Unstake { .. } => TxKind::Unstake,
        }
    }
}

/// The ordered transaction plan for one reconciliation invocation.
/// Built immutably, consumed once.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub actions: Vec<PlanAction>,
    pub warnings: Vec<String>,
    /// Unstaking before the next checkpoint forfeits the epoch's work; in
    /// attended mode the operator must confirm. Moot once evicted.
    pub requires_checkpoint_confirmation: bool,
    pub note: Option<String>,
}

/// Unstake eligibility: refused only while the minimum staking duration
/// has not elapsed AND there are still rewards that waiting would keep.
pub fn unstaking_available(
    now: u64,
    staked_since_ts: u64,
    min_staking_duration: u64,
    available_rewards: U256,
) -> bool {
    let staked_for = now.saturating_sub(staked_since_ts);
    !(staked_for < min_staking_duration && available_rewards > U256::ZERO)
}

fn check_unstaking_availability(
    snapshot: &StakingSnapshot,
    program: &str,
    now: u64,
) -> Result<(), OperatorError> {
    if unstaking_available(
        now,
        snapshot.staked_since_ts,
        snapshot.min_staking_duration,
        snapshot.current_rewards,
    ) {
        return Ok(());
    }
    let staked_for = now.saturating_sub(snapshot.staked_since_ts);
    Err(OperatorError::guard(
        format!(
            "service {} has been staked on {program} for {} and cannot be unstaked \
             until it has been staked for at least {}",
            snapshot.service_id,
            format_duration(staked_for),
            format_duration(snapshot.min_staking_duration),
        ),
        "Wait until the minimum staking duration has passed and retry.",
    ))
}

fn checkpoint_warning(snapshot: &StakingSnapshot) -> String {
    let last_ts = snapshot
        .next_checkpoint_ts
        .saturating_sub(snapshot.liveness_period);
    let fmt = |ts: u64| {
        Utc.timestamp_opt(ts as i64, 0)
            .single()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| ts.to_string())
    };
    format!(
        "Staking checkpoint call not available yet: the liveness period ({:.1} hours) has \
         not passed since the last checkpoint call ({}; next availability {}). Work done \
         since the last checkpoint will not be accounted for rewards if you unstake now.",
        snapshot.liveness_period as f64 / 3600.0,
        fmt(last_ts),
        fmt(snapshot.next_checkpoint_ts),
    )
}

/// Build the transaction plan for one invocation.
///
/// Target semantics:
/// - target == sentinel: drive toward unstaked.
/// - target == current program: keep staked while rewards remain; unstake
///   when rewards are exhausted or the service was evicted.
/// - target != current program: unstake from the current program only;
///   staking on the target is the next invocation's step.
pub fn build_plan(
    snapshot: &StakingSnapshot,
    target: &str,
    now: u64,
) -> Result<Plan, OperatorError> {
    let mut plan = Plan::default();

    let current = match &snapshot.current_program {
        Some(program) if snapshot.state.is_staked() => program.clone(),
        _ => {
            // Not staked anywhere.
            if target == NO_STAKING_PROGRAM_ID {
                plan.note = Some(format!(
                    "service {} is not staked and no staking program is selected; nothing to do",
                    snapshot.service_id
                ));
                return Ok(plan);
            }
            if snapshot.target_slots == 0 {
                return Err(OperatorError::guard(
                    format!("all staking slots for {target} are taken"),
                    "Select a different staking program or wait for a slot to free up.",
                ));
            }
            if snapshot.target_rewards == U256::ZERO {
                return Err(OperatorError::guard(
                    format!("no rewards available on {target}"),
                    "Staking would accrue nothing; select a program with available rewards.",
                ));
            }
            plan.actions = vec![
                PlanAction::Approve {
                    program: target.to_string(),
                },
                PlanAction::Stake {
                    program: target.to_string(),
                },
            ];
            return Ok(plan);
        }
    };

    let evicted = snapshot.state == StakingState::Evicted;
    if evicted {
        plan.warnings.push(format!(
            "service {} has been evicted from the {current} staking program due to inactivity",
            snapshot.service_id
        ));
    }

    if current != target {
        // Off-target (or target is the sentinel): unstake only.
        check_unstaking_availability(snapshot, &current, now)?;
        if !evicted && now < snapshot.next_checkpoint_ts && snapshot.current_rewards > U256::ZERO {
            plan.warnings.push(checkpoint_warning(snapshot));
            plan.requires_checkpoint_confirmation = true;
        }
        plan.actions = vec![PlanAction::Unstake { program: current }];
        if target != NO_STAKING_PROGRAM_ID {
            plan.note = Some(format!(
                "re-run after unstaking completes to stake on {target}"
            ));
        }
        return Ok(plan);
    }

    // Staked on the target program.
    if evicted {
        check_unstaking_availability(snapshot, &current, now)?;
        plan.actions = vec![PlanAction::Unstake { program: current }];
        plan.note = Some(format!("re-run to stake on {target} again"));
        return Ok(plan);
    }

    if snapshot.current_rewards == U256::ZERO {
        // Remaining staked with zero rewards accrues no benefit.
        check_unstaking_availability(snapshot, &current, now)?;
        plan.actions = vec![PlanAction::Unstake { program: current.clone() }];
        plan.note = Some(format!("no rewards available on {current}; unstaking"));
        return Ok(plan);
    }

    plan.note = Some(format!(
        "there are rewards available; service {} should remain staked on {current}",
        snapshot.service_id
    ));
    Ok(plan)
}

/// Confirmation hook for attended runs. The binary wires this to stdin;
/// unattended runs use [`AutoConfirm`].
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Proceeds without asking.
pub struct AutoConfirm;

impl Confirm for AutoConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// A submitted transaction, for the invocation summary.
#[derive(Debug, Clone)]
pub struct ExecutedTx {
    pub kind: TxKind,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub executed: Vec<ExecutedTx>,
    pub note: Option<String>,
}

pub struct Reconciler<'a> {
    pub client: &'a ChainClient,
    pub catalog: &'a StakingCatalog,
    pub config: &'a OperatorConfig,
}

impl Reconciler<'_> {
    /// Run one reconciliation pass toward `target`.
    ///
    /// State is re-derived from chain on every invocation, so a completed
    /// plan makes the next run a no-op and a partially executed plan is
    /// simply re-planned from wherever it stopped.
    pub async fn reconcile(
        &self,
        target: &str,
        confirm: &dyn Confirm,
    ) -> Result<ReconcileOutcome, OperatorError> {
        if target != NO_STAKING_PROGRAM_ID {
            // Fail early on unknown targets, before any probing.
            self.catalog.resolve(target)?;
        }

        let snapshot = collect_snapshot(self.client, self.catalog, self.config, target).await?;
        let now = Utc::now().timestamp().max(0) as u64;
        let plan = build_plan(&snapshot, target, now)?;

        for warning in &plan.warnings {
            tracing::warn!("{warning}");
        }

        if plan.requires_checkpoint_confirmation
            && self.config.attended
            && !confirm.confirm(&format!(
                "Do you want to continue unstaking service {} before the next checkpoint?",
                self.config.service_id
            ))
        {
            return Err(OperatorError::guard(
                "unstaking cancelled by operator",
                "Re-run after the next checkpoint to keep this epoch's rewards.",
            ));
        }

        let executed = self.execute_plan(&plan).await?;
        Ok(ReconcileOutcome {
            executed,
            note: plan.note,
        })
    }

    /// Submit the plan's transactions strictly in order, each awaited to a
    /// receipt before the next is sent. No rollback on failure: the next
    /// run re-derives state from chain.
    pub async fn execute_plan(&self, plan: &Plan) -> Result<Vec<ExecutedTx>, OperatorError> {
        let mut executed = Vec::with_capacity(plan.actions.len());
        for action in &plan.actions {
            let tx = self.descriptor_for(action)?;
            tracing::info!("Submitting {} transaction to {}", action.kind(), tx.to);
            let receipt = self.client.submit(&tx).await?;
            executed.push(ExecutedTx {
                kind: action.kind(),
                tx_hash: format!("{}", receipt.transaction_hash),
            });
        }
        Ok(executed)
    }

    fn descriptor_for(&self, action: &PlanAction) -> Result<TxDescriptor, OperatorError> {
        let service_id = U256::from(self.config.service_id);
        match action {
            // The service registry NFT approval reuses the ERC-20 call
            // shape: approve(spender, tokenId).
            PlanAction::Approve { program } => {
                let staking_contract = self.catalog.resolve(program)?;
                let call = IERC20::approveCall {
                    spender: staking_contract,
                    amount: service_id,
                };
                Ok(TxDescriptor::call(
                    self.config.service_registry,
                    Bytes::from(call.abi_encode()),
                ))
            }
            PlanAction::Stake { program } => {
                let staking_contract = self.catalog.resolve(program)?;
                let call = IStakingToken::stakeCall {
                    serviceId: service_id,
                };
                Ok(TxDescriptor::call(
                    staking_contract,
                    Bytes::from(call.abi_encode()),
                ))
            }
            PlanAction::Unstake { program } => {
                let staking_contract = self.catalog.resolve(program)?;
                let call = IStakingToken::unstakeCall {
                    serviceId: service_id,
                };
                Ok(TxDescriptor::call(
                    staking_contract,
                    Bytes::from(call.abi_encode()),
                ))
            }
        }
    }

    /// Claim accrued rewards. Independent of the reconciliation state
    /// machine: operators may claim while remaining staked.
    pub async fn claim(&self, program: &str) -> Result<ExecutedTx, OperatorError> {
        let staking_contract = self.catalog.resolve(program)?;
        let call = IStakingToken::claimCall {
            serviceId: U256::from(self.config.service_id),
        };
        let tx = TxDescriptor::call(staking_contract, Bytes::from(call.abi_encode()));
        let receipt = self.client.submit(&tx).await?;
        Ok(ExecutedTx {
            kind: TxKind::Claim,
            tx_hash: format!("{}", receipt.transaction_hash),
        })
    }

    /// Build a claim transaction descriptor without submitting it.
    pub fn claim_descriptor(&self, program: &str) -> Result<TxDescriptor, OperatorError> {
        let staking_contract = self.catalog.resolve(program)?;
        let call = IStakingToken::claimCall {
            serviceId: U256::from(self.config.service_id),
        };
        Ok(TxDescriptor::call(
            staking_contract,
            Bytes::from(call.abi_encode()),
        ))
    }
}

/// Addresses needed by tests and the binary to label executed plans.
pub fn describe_actions(plan: &Plan) -> Vec<TxKind> {
    plan.actions.iter().map(|a| a.kind()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM_X: &str = "quickstart_beta_expert";
    const PROGRAM_Y: &str = "quickstart_beta_hobbyist";

    fn snapshot_unstaked() -> StakingSnapshot {
        StakingSnapshot {
            service_id: 42,
            current_program: None,
            state: StakingState::Unstaked,
            staked_since_ts: 0,
            next_checkpoint_ts: 0,
            liveness_period: 0,
            min_staking_duration: 0,
            current_rewards: U256::ZERO,
            target_rewards: U256::ZERO,
            target_slots: 0,
        }
    }

    fn snapshot_staked(program: &str, state: StakingState) -> StakingSnapshot {
        StakingSnapshot {
            service_id: 42,
            current_program: Some(program.to_string()),
            state,
            staked_since_ts: 1_000,
            next_checkpoint_ts: 0,
            liveness_period: 86_400,
            min_staking_duration: 0,
            current_rewards: U256::ZERO,
            target_rewards: U256::ZERO,
            target_slots: 0,
        }
    }

    #[test]
    fn test_scenario_a_unstaked_no_target_is_noop() {
        let plan = build_plan(&snapshot_unstaked(), NO_STAKING_PROGRAM_ID, 2_000).unwrap();
        assert!(plan.actions.is_empty());
        assert!(plan.note.is_some());
    }

    #[test]
    fn test_scenario_b_unstaked_with_target_stakes() {
        let mut snapshot = snapshot_unstaked();
        snapshot.target_slots = 5;
        snapshot.target_rewards = U256::from(1_000);
        let plan = build_plan(&snapshot, PROGRAM_X, 2_000).unwrap();
        assert_eq!(
            describe_actions(&plan),
            vec![TxKind::Approve, TxKind::Stake]
        );
    }

    #[test]
    fn test_scenario_b_approval_precedes_stake() {
        let mut snapshot = snapshot_unstaked();
        snapshot.target_slots = 1;
        snapshot.target_rewards = U256::from(1);
        let plan = build_plan(&snapshot, PROGRAM_X, 2_000).unwrap();
        assert!(matches!(plan.actions[0], PlanAction::Approve { .. }));
        assert!(matches!(plan.actions[1], PlanAction::Stake { .. }));
    }

    #[test]
    fn test_stake_refused_when_no_slots() {
        let mut snapshot = snapshot_unstaked();
        snapshot.target_slots = 0;
        snapshot.target_rewards = U256::from(1_000);
        let err = build_plan(&snapshot, PROGRAM_X, 2_000).unwrap_err();
        assert!(matches!(err, OperatorError::StakingGuard { .. }));
    }

    #[test]
    fn test_stake_refused_when_no_rewards() {
        let mut snapshot = snapshot_unstaked();
        snapshot.target_slots = 5;
        let err = build_plan(&snapshot, PROGRAM_X, 2_000).unwrap_err();
        assert!(matches!(err, OperatorError::StakingGuard { .. }));
    }

    #[test]
    fn test_scenario_c_zero_rewards_unstakes() {
        let snapshot = snapshot_staked(PROGRAM_X, StakingState::Staked);
        let plan = build_plan(&snapshot, PROGRAM_X, 2_000).unwrap();
        assert_eq!(describe_actions(&plan), vec![TxKind::Unstake]);
    }

    #[test]
    fn test_staked_with_rewards_is_terminal_noop() {
        let mut snapshot = snapshot_staked(PROGRAM_X, StakingState::Staked);
        snapshot.current_rewards = U256::from(500);
        let plan = build_plan(&snapshot, PROGRAM_X, 2_000).unwrap();
        assert!(plan.actions.is_empty());
        assert!(plan.note.unwrap().contains("remain staked"));
    }

    #[test]
    fn test_scenario_d_off_target_unstakes_only() {
        let mut snapshot = snapshot_staked(PROGRAM_Y, StakingState::Staked);
        snapshot.current_rewards = U256::from(500);
        // Target contract looks perfectly stakeable, but this invocation
        // must still only unstake.
        snapshot.target_slots = 5;
        snapshot.target_rewards = U256::from(1_000);
        let plan = build_plan(&snapshot, PROGRAM_X, 2_000).unwrap();
        assert_eq!(describe_actions(&plan), vec![TxKind::Unstake]);
        assert_eq!(
            plan.actions[0],
            PlanAction::Unstake {
                program: PROGRAM_Y.to_string()
            }
        );
        assert!(plan.note.unwrap().contains(PROGRAM_X));
    }

    #[test]
    fn test_scenario_e_min_duration_with_rewards_refuses() {
        let mut snapshot = snapshot_staked(PROGRAM_X, StakingState::Staked);
        snapshot.staked_since_ts = 0;
        snapshot.min_staking_duration = 100;
        snapshot.current_rewards = U256::from(50);
        // now - staked_since = 10 < 100, rewards > 0: refused.
        let err = build_plan(&snapshot, NO_STAKING_PROGRAM_ID, 10).unwrap_err();
        assert!(matches!(err, OperatorError::StakingGuard { .. }));
    }

    #[test]
    fn test_guard_property_grid() {
        // Refused only when (now - start < min) && rewards > 0.
        assert!(!unstaking_available(10, 0, 100, U256::from(50)));
        assert!(unstaking_available(10, 0, 100, U256::ZERO));
        assert!(unstaking_available(200, 0, 100, U256::from(50)));
        assert!(unstaking_available(100, 0, 100, U256::from(50)));
        assert!(unstaking_available(0, 0, 0, U256::from(50)));
        assert!(unstaking_available(0, 0, 0, U256::ZERO));
    }

    #[test]
    fn test_evicted_on_target_unstakes_without_checkpoint_prompt() {
        let mut snapshot = snapshot_staked(PROGRAM_X, StakingState::Evicted);
        snapshot.current_rewards = U256::from(500);
        snapshot.next_checkpoint_ts = 10_000;
        let plan = build_plan(&snapshot, PROGRAM_X, 2_000).unwrap();
        assert_eq!(describe_actions(&plan), vec![TxKind::Unstake]);
        assert!(!plan.requires_checkpoint_confirmation);
        assert!(!plan.warnings.is_empty());
    }

    #[test]
    fn test_checkpoint_confirmation_required_mid_epoch() {
        let mut snapshot = snapshot_staked(PROGRAM_Y, StakingState::Staked);
        snapshot.current_rewards = U256::from(500);
        snapshot.next_checkpoint_ts = 10_000;
        let plan = build_plan(&snapshot, NO_STAKING_PROGRAM_ID, 2_000).unwrap();
        assert_eq!(describe_actions(&plan), vec![TxKind::Unstake]);
        assert!(plan.requires_checkpoint_confirmation);
        assert!(plan.warnings.iter().any(|w| w.contains("checkpoint")));
    }

    #[test]
    fn test_no_checkpoint_confirmation_after_checkpoint() {
        let mut snapshot = snapshot_staked(PROGRAM_Y, StakingState::Staked);
        snapshot.current_rewards = U256::from(500);
        snapshot.next_checkpoint_ts = 1_500;
        let plan = build_plan(&snapshot, NO_STAKING_PROGRAM_ID, 2_000).unwrap();
        assert!(!plan.requires_checkpoint_confirmation);
    }

    #[test]
    fn test_idempotent_noop_when_plan_completed() {
        // After a successful [approve, stake] run the next snapshot shows
        // the service staked on target with rewards: planning again is a
        // no-op, derived purely from chain state.
        let mut snapshot = snapshot_staked(PROGRAM_X, StakingState::Staked);
        snapshot.current_rewards = U256::from(1_000);
        let first = build_plan(&snapshot, PROGRAM_X, 5_000).unwrap();
        let second = build_plan(&snapshot, PROGRAM_X, 5_001).unwrap();
        assert!(first.actions.is_empty());
        assert!(second.actions.is_empty());
    }
}
