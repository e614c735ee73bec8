//! Per-term staking housekeeping co-maintained with block production:
//! the cycle watcher, the candidate cache, the un-bonding schedule and
//! the award / vote-reward builders.
//!
//! All rows live in the confirmed side-table and are written through
//! the shared confirm batch, one atomic commit per operation.

use super::Miner;
use crate::consensus::Consensus;
use crate::error::MinerError;
use crate::ledger::Ledger;
use crate::state::State;
use crate::tables::{
    ballot_key, cache_key, frozen_key, CacheVoteCandidate, CandidateRatio, CandidateSet,
    FrozenAssetsTable, NodeThawTable, TermRecord, CANDIDATE_SET_KEY, TERM_TABLE_KEY,
    THAW_SCHEDULE_KEY,
};
use crate::types::Transaction;

impl Miner {
    /// Observe the consensus term and flip the one-shot new-cycle
    /// flag. Fires exactly once per (replica, term); any failure is
    /// logged and reported as "not a new cycle".
    pub fn read_term_table(&self) -> bool {
        let table = self.ctx.ledger.confirmed_table();
        let batch = self.ctx.ledger.confirm_batch();

        let current_term = match self.ctx.consensus.status() {
            Ok(status) => status.current_term,
            Err(_) => return false,
        };

        let stored = match table.get::<TermRecord>(TERM_TABLE_KEY) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(err = %e, "read term table failed");
                return false;
            }
        };

        let record = match stored {
            Some(record) if record.term == current_term && !record.new_cycle => {
                // Already observed this term, nothing to rewrite.
                return false;
            }
            Some(record) if record.term == current_term => TermRecord {
                term: current_term,
                new_cycle: false,
            },
            Some(_) => TermRecord {
                term: current_term,
                new_cycle: true,
            },
            None => TermRecord {
                term: current_term,
                new_cycle: false,
            },
        };

        if let Err(e) = batch.put_record(TERM_TABLE_KEY, &record) {
            tracing::warn!(err = %e, "stage term record failed");
            batch.discard();
            return false;
        }
        if let Err(e) = batch.write() {
            tracing::warn!(err = %e, "term table atomic write failed");
            return false;
        }

        record.new_cycle
    }

    /// New cycle: snapshot every candidate's voter map, commission
    /// ratio and vote total into its cache row. A failed candidate
    /// read aborts the commit; the next cycle retries.
    pub fn update_cache_table(&self) {
        let table = self.ctx.ledger.confirmed_table();
        let batch = self.ctx.ledger.confirm_batch();

        let candidate_set = match table.get::<CandidateSet>(CANDIDATE_SET_KEY) {
            Ok(Some(set)) => set,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(err = %e, "read candidate set failed");
                return;
            }
        };

        for address in candidate_set.candidates.keys() {
            let ballot = match table.get::<CandidateRatio>(&ballot_key(address)) {
                Ok(Some(ballot)) => ballot,
                Ok(None) => {
                    tracing::warn!(candidate = %address, "ballot record missing, caching empty row");
                    CandidateRatio::default()
                }
                Err(e) => {
                    tracing::warn!(candidate = %address, err = %e, "read ballot record failed");
                    batch.discard();
                    return;
                }
            };

            let cache = CacheVoteCandidate {
                voting_user: ballot.voting_user,
                ratio: ballot.ratio,
                total_vote: ballot.be_voted_total,
            };
            if let Err(e) = batch.put_record(&cache_key(address), &cache) {
                tracing::warn!(candidate = %address, err = %e, "stage cache row failed");
                batch.discard();
                return;
            }
        }

        if let Err(e) = batch.write() {
            tracing::warn!(err = %e, "cache table atomic write failed");
        }
    }

    /// Reverse-transfer txs for every un-bonding entry due at
    /// `height`. An absent schedule is a non-error.
    pub fn thaw_txs(&self, height: i64) -> Result<Vec<Transaction>, MinerError> {
        let table = self.ctx.ledger.confirmed_table();
        let batch = self.ctx.ledger.confirm_batch();

        let Some(schedule) = table.get::<NodeThawTable>(THAW_SCHEDULE_KEY)? else {
            return Ok(Vec::new());
        };
        let Some(entries) = schedule.node_details.get(&height) else {
            return Ok(Vec::new());
        };

        let mut txs = Vec::with_capacity(entries.len());
        for entry in entries {
            let tx = self
                .ctx
                .state
                .reverse_tx(&entry.address, &batch, entry.amount)
                .map_err(|e| {
                    tracing::warn!(err = %e, "build reverse transfer failed");
                    e
                })?;
            txs.push(tx);
        }

        Ok(txs)
    }

    /// Finalize un-bonding at `height`: drop matured thaw entries from
    /// every affected frozen-asset row, decrement their totals and
    /// delete the schedule slot, all in one atomic commit.
    pub fn clear_thaw(&self, height: i64) -> Result<(), MinerError> {
        if height < 0 {
            return Ok(());
        }

        let table = self.ctx.ledger.confirmed_table();
        let batch = self.ctx.ledger.confirm_batch();

        let Some(mut schedule) = table.get::<NodeThawTable>(THAW_SCHEDULE_KEY)? else {
            return Ok(());
        };
        let Some(entries) = schedule.node_details.get(&height).cloned() else {
            return Ok(());
        };

        let staged = (|| -> Result<(), MinerError> {
            for entry in &entries {
                let key = frozen_key(&entry.address);
                let Some(frozen) = table.get::<FrozenAssetsTable>(&key)? else {
                    tracing::warn!(address = %entry.address, "frozen assets row missing while clearing thaw");
                    return Err(MinerError::Ledger(
                        "frozen assets row missing for thawed address".to_string(),
                    ));
                };

                let mut rewritten = FrozenAssetsTable {
                    total: frozen.total,
                    frozen_detail: frozen.frozen_detail,
                    timestamp: frozen.timestamp,
                    ..Default::default()
                };
                for (tag, detail) in frozen.thaw_detail {
                    if detail.height > height {
                        rewritten.thaw_detail.insert(tag, detail);
                    } else {
                        rewritten.total = rewritten.total.saturating_sub(detail.amount);
                    }
                }
                batch.put_record(&key, &rewritten)?;
            }

            schedule.node_details.remove(&height);
            batch.put_record(THAW_SCHEDULE_KEY, &schedule)?;
            Ok(())
        })();
        if let Err(e) = staged {
            batch.discard();
            return Err(e);
        }

        batch.write().map_err(|e| {
            tracing::warn!(err = %e, "thaw cleanup atomic write failed");
            MinerError::Storage(e)
        })?;

        tracing::debug!(height, addresses = entries.len(), "cleared matured thaw entries");
        Ok(())
    }

    /// Build the block award tx. With `suppress_split` the producer
    /// keeps the whole award; otherwise the stake-holder share is
    /// carved out and returned for vote-reward distribution.
    pub(super) fn award_tx(
        &self,
        height: i64,
        suppress_split: bool,
        now_ns: i64,
    ) -> Result<(Transaction, u64), MinerError> {
        let amount = self.ctx.ledger.calc_award(height);
        if amount < 0 {
            return Err(MinerError::Parameter(
                "amount in transaction can not be negative number",
            ));
        }
        let amount = amount as u64;

        let remain = if suppress_split {
            0
        } else {
            self.assign_rewards(amount)
        };
        let tx = Transaction::award(
            &self.ctx.keypair.address,
            amount - remain,
            b"award",
            now_ns,
        );
        Ok((tx, remain))
    }

    /// Stake-holder share of `amount` for this producer, from its
    /// cycle-start cache row. Candidates without voters keep it all.
    fn assign_rewards(&self, amount: u64) -> u64 {
        let table = self.ctx.ledger.confirmed_table();
        let cache = match table.get::<CacheVoteCandidate>(&cache_key(&self.ctx.keypair.address)) {
            Ok(Some(cache)) => cache,
            _ => return 0,
        };
        if cache.ratio == 0 || cache.total_vote == 0 || cache.voting_user.is_empty() {
            return 0;
        }

        ((amount as u128 * cache.ratio as u128) / 100) as u64
    }

    /// Split the reserved award over this cycle's voters, pro rata by
    /// votes. Sub-unit remainders are not minted.
    pub(super) fn vote_award_txs(
        &self,
        remain_award: u64,
        now_ns: i64,
    ) -> Result<Vec<Transaction>, MinerError> {
        let table = self.ctx.ledger.confirmed_table();
        let Some(cache) = table.get::<CacheVoteCandidate>(&cache_key(&self.ctx.keypair.address))?
        else {
            return Ok(Vec::new());
        };
        if cache.total_vote == 0 {
            return Ok(Vec::new());
        }

        let mut txs = Vec::new();
        for (voter, votes) in &cache.voting_user {
            let share =
                ((remain_award as u128 * *votes as u128) / cache.total_vote as u128) as u64;
            if share == 0 {
                continue;
            }
            txs.push(Transaction::vote_award(
                &self.ctx.keypair.address,
                voter,
                share,
                now_ns,
            ));
        }
        Ok(txs)
    }
}
