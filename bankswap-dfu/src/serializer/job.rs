// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Progress of the request at the head of the queue.
//!
//! Every `start`/`advance` call issues exactly one driver operation or
//! reports that the request is finished.

use super::swap::{SwapPlan, SwapState};
use super::{FlashRequest, Op};
use crate::flash::{is_erased, read_words, FlashDriver};
use crate::layout::{FlashLayout, WORD_SIZE};

pub(crate) enum Job {
    Store,
    Clear { page: u32, end: u32 },
    Update(UpdateJob),
    Recover(Recovery),
}

pub(crate) struct UpdateJob {
    /// Payload bytes already committed by finished pages.
    done: u32,
    plan: SwapPlan,
    state: SwapState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum RecoveryStep {
    EraseTarget,
    RestoreTarget,
    ClearJournal,
    EraseSwap,
    Done,
}

const RECOVERY_ORDER: [RecoveryStep; 4] = [
    RecoveryStep::EraseTarget,
    RecoveryStep::RestoreTarget,
    RecoveryStep::ClearJournal,
    RecoveryStep::EraseSwap,
];

/// Cleanup of a swap sequence cut short by power loss or a hardware fault.
pub(crate) struct Recovery {
    /// Page to roll back from the swap copy, when the journal tag is valid.
    target: Option<u32>,
    clear_journal: bool,
    erase_swap: bool,
    step: RecoveryStep,
}

impl Recovery {
    /// Inspect the swap and journal pages. `None` when both are clean.
    pub(crate) fn plan<D: FlashDriver + ?Sized>(driver: &D, layout: &FlashLayout) -> Option<Self> {
        let tag = driver.read_word(layout.journal_page);
        let check = driver.read_word(layout.journal_page + WORD_SIZE);
        let clear_journal = !is_erased(driver, layout.journal_page, layout.page_size);
        let erase_swap = !is_erased(driver, layout.swap_page, layout.page_size);

        let target = (tag == !check && layout.is_data_page(tag)).then_some(tag);
        if target.is_none() && !clear_journal && !erase_swap {
            return None;
        }

        let mut recovery = Self {
            target,
            clear_journal,
            erase_swap,
            step: RecoveryStep::Done,
        };
        recovery.step = recovery.following(None);
        Some(recovery)
    }

    pub(crate) fn target(&self) -> Option<u32> {
        self.target
    }

    fn enabled(&self, step: RecoveryStep) -> bool {
        match step {
            RecoveryStep::EraseTarget | RecoveryStep::RestoreTarget => self.target.is_some(),
            RecoveryStep::ClearJournal => self.clear_journal,
            RecoveryStep::EraseSwap => self.erase_swap,
            RecoveryStep::Done => true,
        }
    }

    fn following(&self, current: Option<RecoveryStep>) -> RecoveryStep {
        let from = match current {
            None => 0,
            Some(step) => RECOVERY_ORDER
                .iter()
                .position(|&s| s == step)
                .map_or(RECOVERY_ORDER.len(), |i| i + 1),
        };
        RECOVERY_ORDER[from..]
            .iter()
            .copied()
            .find(|&s| self.enabled(s))
            .unwrap_or(RecoveryStep::Done)
    }

    fn issue<D: FlashDriver>(&self, layout: &FlashLayout, driver: &mut D, scratch: &mut [u32]) {
        match self.step {
            RecoveryStep::EraseTarget => {
                if let Some(page) = self.target {
                    driver.begin_erase(page);
                }
            }
            RecoveryStep::RestoreTarget => {
                if let Some(page) = self.target {
                    let words = &mut scratch[..layout.page_words()];
                    read_words(&*driver, layout.swap_page, words);
                    driver.begin_write(page, words);
                }
            }
            RecoveryStep::ClearJournal => driver.begin_erase(layout.journal_page),
            RecoveryStep::EraseSwap => driver.begin_erase(layout.swap_page),
            RecoveryStep::Done => {}
        }
    }
}

impl UpdateJob {
    fn issue<D: FlashDriver>(
        &self,
        request: &FlashRequest,
        layout: &FlashLayout,
        driver: &mut D,
        scratch: &mut [u32],
    ) {
        let plan = &self.plan;
        let page_words = layout.page_words();
        match self.state {
            SwapState::BackupToSwap => {
                let words = &mut scratch[..page_words];
                read_words(&*driver, plan.page, words);
                driver.begin_write(layout.swap_page, words);
            }
            SwapState::MarkDirty => driver.begin_write(layout.journal_page, &[plan.page, !plan.page]),
            SwapState::EraseTarget => driver.begin_erase(plan.page),
            SwapState::RestoreHead => {
                let words = &mut scratch[..plan.head_words as usize];
                read_words(&*driver, layout.swap_page, words);
                driver.begin_write(plan.page, words);
            }
            SwapState::RestoreTail => {
                let skip = (plan.head_words + plan.body_words) * WORD_SIZE;
                let words = &mut scratch[..plan.tail_words as usize];
                read_words(&*driver, layout.swap_page + skip, words);
                driver.begin_write(plan.page + skip, words);
            }
            SwapState::WriteBody => {
                let first = (self.done / WORD_SIZE) as usize;
                let words = &request.payload[first..first + plan.body_words as usize];
                driver.begin_write(plan.page + plan.head_words * WORD_SIZE, words);
            }
            SwapState::ClearDirty => driver.begin_erase(layout.journal_page),
            SwapState::EraseSwap => driver.begin_erase(layout.swap_page),
            SwapState::Init | SwapState::Complete => {
                error!("swap step {} issued out of sequence", self.state);
            }
        }
    }

    fn begin_page(request: &FlashRequest, layout: &FlashLayout, done: u32) -> Self {
        let plan = SwapPlan::for_range(layout, request.address + done, request.size - done);
        Self {
            done,
            plan,
            state: SwapState::Init.next(&plan),
        }
    }
}

impl Job {
    /// Issue the first operation of `request`. `None` when there is nothing
    /// to do.
    pub(crate) fn start<D: FlashDriver>(
        request: &FlashRequest,
        layout: &FlashLayout,
        driver: &mut D,
        scratch: &mut [u32],
    ) -> Option<Job> {
        match request.op {
            Op::Store => {
                driver.begin_write(request.address, &request.payload);
                Some(Job::Store)
            }
            Op::Clear => {
                let end = layout
                    .page_span(request.size)
                    .and_then(|span| request.address.checked_add(span))
                    .unwrap_or(request.address);
                driver.begin_erase(request.address);
                Some(Job::Clear {
                    page: request.address,
                    end,
                })
            }
            Op::Update => {
                let job = UpdateJob::begin_page(request, layout, 0);
                job.issue(request, layout, driver, scratch);
                Some(Job::Update(job))
            }
            Op::Recover => {
                let recovery = Recovery::plan(&*driver, layout)?;
                match recovery.target() {
                    Some(page) => warn!("rolling back interrupted rewrite of page {=u32:#x}", page),
                    None => info!("cleaning up swap area"),
                }
                recovery.issue(layout, driver, scratch);
                Some(Job::Recover(recovery))
            }
        }
    }

    /// The last issued operation succeeded. Issue the next one, or return
    /// `None` when the request is finished.
    pub(crate) fn advance<D: FlashDriver>(
        self,
        request: &FlashRequest,
        layout: &FlashLayout,
        driver: &mut D,
        scratch: &mut [u32],
    ) -> Option<Job> {
        match self {
            Job::Store => None,
            Job::Clear { page, end } => {
                let next = page + layout.page_size;
                if next >= end {
                    return None;
                }
                driver.begin_erase(next);
                Some(Job::Clear { page: next, end })
            }
            Job::Update(mut job) => {
                job.state = job.state.next(&job.plan);
                if job.state == SwapState::Complete {
                    let done = job.done + job.plan.body_bytes();
                    if done >= request.size {
                        return None;
                    }
                    job = UpdateJob::begin_page(request, layout, done);
                }
                job.issue(request, layout, driver, scratch);
                Some(Job::Update(job))
            }
            Job::Recover(mut recovery) => {
                recovery.step = recovery.following(Some(recovery.step));
                if recovery.step == RecoveryStep::Done {
                    return None;
                }
                recovery.issue(layout, driver, scratch);
                Some(Job::Recover(recovery))
            }
        }
    }

    /// Whether a fault at this point may leave the swap area dirty.
    pub(crate) fn touches_swap_area(&self) -> bool {
        match self {
            Job::Update(job) => !job.plan.is_whole_page(),
            Job::Store | Job::Clear { .. } | Job::Recover(_) => false,
        }
    }
}
