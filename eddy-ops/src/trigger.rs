//! Triggers decide when the elements buffered for a window are emitted.
//!
//! A trigger keeps no state of its own. Everything it needs to remember
//! (element counts, whether the on-time pane went out, which sub-trigger is
//! active) lives in per-window integer tags reached through a
//! [`TriggerContext`]. Composite triggers hand their children a
//! [`NestedContext`] that prefixes every tag and timer name.

use chrono::Duration;
use eddy_core::{Result, Timestamp, Window};
use eddy_state::{Combine, TimeDomain};

/// Per-window view of trigger state and timers.
pub trait TriggerContext {
    /// Processing time as last observed for this key.
    fn current_time(&self) -> Timestamp;
    fn set_timer(&mut self, name: &str, domain: TimeDomain, timestamp: Timestamp);
    fn clear_timer(&mut self, name: &str, domain: TimeDomain);
    fn add_state(&mut self, tag: &str, value: i64) -> Result<()>;
    /// Folds every value added under `tag`; `None` if nothing was added.
    fn get_state(&self, tag: &str, combine: Combine) -> Result<Option<i64>>;
    fn clear_state(&mut self, tag: &str) -> Result<()>;
}

pub struct NestedContext<'a> {
    inner: &'a mut dyn TriggerContext,
    prefix: String,
}

impl<'a> NestedContext<'a> {
    pub fn new(inner: &'a mut dyn TriggerContext, prefix: impl Into<String>) -> Self {
        Self { inner, prefix: prefix.into() }
    }

    fn name(&self, tag: &str) -> String {
        format!("{}{}", self.prefix, tag)
    }
}

impl TriggerContext for NestedContext<'_> {
    fn current_time(&self) -> Timestamp {
        self.inner.current_time()
    }

    fn set_timer(&mut self, name: &str, domain: TimeDomain, timestamp: Timestamp) {
        let name = self.name(name);
        self.inner.set_timer(&name, domain, timestamp)
    }

    fn clear_timer(&mut self, name: &str, domain: TimeDomain) {
        let name = self.name(name);
        self.inner.clear_timer(&name, domain)
    }

    fn add_state(&mut self, tag: &str, value: i64) -> Result<()> {
        let tag = self.name(tag);
        self.inner.add_state(&tag, value)
    }

    fn get_state(&self, tag: &str, combine: Combine) -> Result<Option<i64>> {
        self.inner.get_state(&self.name(tag), combine)
    }

    fn clear_state(&mut self, tag: &str) -> Result<()> {
        let tag = self.name(tag);
        self.inner.clear_state(&tag)
    }
}

const COUNT_TAG: &str = "count";
const IS_LATE_TAG: &str = "is_late";
const FIRE_AT_TAG: &str = "fire_at";
const INDEX_TAG: &str = "index";

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Fires whenever the watermark passes the end of the window, including
    /// again for late data; never finishes on its own.
    Default,
    AfterWatermark { early: Option<Box<Trigger>>, late: Option<Box<Trigger>> },
    AfterCount(u64),
    AfterProcessingTime(Duration),
    Repeatedly(Box<Trigger>),
    AfterAny(Vec<Trigger>),
    AfterAll(Vec<Trigger>),
    AfterEach(Vec<Trigger>),
}

impl Trigger {
    /// Early and late firings repeat until the window closes.
    pub fn after_watermark(early: Option<Trigger>, late: Option<Trigger>) -> Self {
        Trigger::AfterWatermark {
            early: early.map(|t| Box::new(Trigger::repeatedly(t))),
            late: late.map(|t| Box::new(Trigger::repeatedly(t))),
        }
    }

    pub fn repeatedly(t: Trigger) -> Self {
        Trigger::Repeatedly(Box::new(t))
    }

    /// Fires with `main`, finishes as soon as `finally` fires.
    pub fn or_finally(main: Trigger, finally: Trigger) -> Self {
        Trigger::AfterAny(vec![main, finally])
    }

    pub fn on_element(&self, window: &Window, ctx: &mut dyn TriggerContext) -> Result<()> {
        match self {
            Trigger::Default => {
                ctx.set_timer("", TimeDomain::Watermark, window.end());
                Ok(())
            }
            Trigger::AfterWatermark { early, late } => {
                if is_late(ctx, late.is_some())? {
                    if let Some(late) = late {
                        late.on_element(window, &mut NestedContext::new(ctx, "late-"))?;
                    }
                } else {
                    if let Some(early) = early {
                        early.on_element(window, &mut NestedContext::new(ctx, "early-"))?;
                    }
                    ctx.set_timer("", TimeDomain::Watermark, window.end());
                }
                Ok(())
            }
            Trigger::AfterCount(_) => ctx.add_state(COUNT_TAG, 1),
            Trigger::AfterProcessingTime(delay) => {
                if ctx.get_state(FIRE_AT_TAG, Combine::Min)?.is_none() {
                    let fire_at = ctx.current_time() + *delay;
                    ctx.add_state(FIRE_AT_TAG, fire_at.micros())?;
                    ctx.set_timer("", TimeDomain::RealTime, fire_at);
                }
                Ok(())
            }
            Trigger::Repeatedly(inner) => inner.on_element(window, ctx),
            Trigger::AfterAny(triggers) | Trigger::AfterAll(triggers) => {
                for (ix, t) in triggers.iter().enumerate() {
                    t.on_element(window, &mut sub_context(ctx, ix))?;
                }
                Ok(())
            }
            Trigger::AfterEach(triggers) => {
                let ix = current_index(ctx)?;
                if let Some(t) = triggers.get(ix) {
                    t.on_element(window, &mut sub_context(ctx, ix))?;
                }
                Ok(())
            }
        }
    }

    /// Called on the merge result's context after state has been migrated.
    pub fn on_merge(&self, to_be_merged: &[Window], result: &Window, ctx: &mut dyn TriggerContext) -> Result<()> {
        match self {
            Trigger::Default => {
                ctx.clear_timer("", TimeDomain::Watermark);
                Ok(())
            }
            Trigger::AfterWatermark { early, late } => {
                if is_late(ctx, late.is_some())? {
                    if let Some(late) = late {
                        late.on_merge(to_be_merged, result, &mut NestedContext::new(ctx, "late-"))?;
                    }
                    return Ok(());
                }
                if to_be_merged.iter().any(|w| w.end() != result.end()) {
                    ctx.clear_timer("", TimeDomain::Watermark);
                }
                if let Some(early) = early {
                    early.on_merge(to_be_merged, result, &mut NestedContext::new(ctx, "early-"))?;
                }
                Ok(())
            }
            Trigger::AfterCount(_) | Trigger::AfterProcessingTime(_) => Ok(()),
            Trigger::Repeatedly(inner) => inner.on_merge(to_be_merged, result, ctx),
            Trigger::AfterAny(triggers) | Trigger::AfterAll(triggers) => {
                for (ix, t) in triggers.iter().enumerate() {
                    t.on_merge(to_be_merged, result, &mut sub_context(ctx, ix))?;
                }
                Ok(())
            }
            Trigger::AfterEach(triggers) => {
                let ix = current_index(ctx)?;
                if let Some(t) = triggers.get(ix) {
                    t.on_merge(to_be_merged, result, &mut sub_context(ctx, ix))?;
                }
                Ok(())
            }
        }
    }

    pub fn should_fire(
        &self,
        domain: TimeDomain,
        watermark: Timestamp,
        window: &Window,
        ctx: &mut dyn TriggerContext,
    ) -> Result<bool> {
        match self {
            Trigger::Default => Ok(watermark >= window.end()),
            Trigger::AfterWatermark { early, late } => {
                if is_late(ctx, late.is_some())? {
                    return match late {
                        Some(late) => late.should_fire(domain, watermark, window, &mut NestedContext::new(ctx, "late-")),
                        None => Ok(false),
                    };
                }
                if watermark >= window.end() {
                    // late elements must not re-fire through the on-time timer
                    ctx.clear_timer("", TimeDomain::Watermark);
                    return Ok(true);
                }
                match early {
                    Some(early) => early.should_fire(domain, watermark, window, &mut NestedContext::new(ctx, "early-")),
                    None => Ok(false),
                }
            }
            Trigger::AfterCount(n) => Ok(ctx.get_state(COUNT_TAG, Combine::Sum)?.unwrap_or(0) >= *n as i64),
            Trigger::AfterProcessingTime(_) => Ok(match ctx.get_state(FIRE_AT_TAG, Combine::Min)? {
                Some(fire_at) => ctx.current_time() >= Timestamp::from_micros(fire_at),
                None => false,
            }),
            Trigger::Repeatedly(inner) => inner.should_fire(domain, watermark, window, ctx),
            Trigger::AfterAny(triggers) => {
                let mut any = false;
                for (ix, t) in triggers.iter().enumerate() {
                    any |= t.should_fire(domain, watermark, window, &mut sub_context(ctx, ix))?;
                }
                Ok(any)
            }
            Trigger::AfterAll(triggers) => {
                let mut all = true;
                for (ix, t) in triggers.iter().enumerate() {
                    all &= t.should_fire(domain, watermark, window, &mut sub_context(ctx, ix))?;
                }
                Ok(all)
            }
            Trigger::AfterEach(triggers) => {
                let ix = current_index(ctx)?;
                match triggers.get(ix) {
                    Some(t) => t.should_fire(domain, watermark, window, &mut sub_context(ctx, ix)),
                    None => Ok(false),
                }
            }
        }
    }

    /// Runs after a pane was emitted; returns whether the window is finished.
    pub fn on_fire(&self, watermark: Timestamp, window: &Window, ctx: &mut dyn TriggerContext) -> Result<bool> {
        match self {
            Trigger::Default => Ok(false),
            Trigger::AfterWatermark { early, late } => {
                if is_late(ctx, late.is_some())? {
                    return match late {
                        Some(late) => late.on_fire(watermark, window, &mut NestedContext::new(ctx, "late-")),
                        None => Ok(true),
                    };
                }
                if watermark >= window.end() {
                    ctx.add_state(IS_LATE_TAG, 1)?;
                    return Ok(late.is_none());
                }
                if let Some(early) = early {
                    early.on_fire(watermark, window, &mut NestedContext::new(ctx, "early-"))?;
                }
                Ok(false)
            }
            Trigger::AfterCount(_) | Trigger::AfterProcessingTime(_) => Ok(true),
            Trigger::Repeatedly(inner) => {
                if inner.on_fire(watermark, window, ctx)? {
                    inner.reset(window, ctx)?;
                }
                Ok(false)
            }
            Trigger::AfterAny(triggers) | Trigger::AfterAll(triggers) => {
                let mut finished = Vec::new();
                for (ix, t) in triggers.iter().enumerate() {
                    let mut sub = sub_context(ctx, ix);
                    if t.should_fire(TimeDomain::Watermark, watermark, window, &mut sub)? {
                        finished.push(t.on_fire(watermark, window, &mut sub)?);
                    }
                }
                Ok(match self {
                    Trigger::AfterAny(_) => finished.iter().any(|f| *f),
                    _ => !finished.is_empty() && finished.iter().all(|f| *f),
                })
            }
            Trigger::AfterEach(triggers) => {
                let mut ix = current_index(ctx)?;
                if let Some(t) = triggers.get(ix) {
                    if t.on_fire(watermark, window, &mut sub_context(ctx, ix))? {
                        ix += 1;
                        ctx.add_state(INDEX_TAG, ix as i64)?;
                    }
                }
                Ok(ix >= triggers.len())
            }
        }
    }

    pub fn reset(&self, window: &Window, ctx: &mut dyn TriggerContext) -> Result<()> {
        match self {
            Trigger::Default => Ok(()),
            Trigger::AfterWatermark { early, late } => {
                if let Some(early) = early {
                    early.reset(window, &mut NestedContext::new(ctx, "early-"))?;
                }
                if let Some(late) = late {
                    late.reset(window, &mut NestedContext::new(ctx, "late-"))?;
                }
                Ok(())
            }
            Trigger::AfterCount(_) => ctx.clear_state(COUNT_TAG),
            Trigger::AfterProcessingTime(_) => {
                ctx.clear_timer("", TimeDomain::RealTime);
                ctx.clear_state(FIRE_AT_TAG)
            }
            Trigger::Repeatedly(inner) => inner.reset(window, ctx),
            Trigger::AfterAny(triggers) | Trigger::AfterAll(triggers) => {
                for (ix, t) in triggers.iter().enumerate() {
                    t.reset(window, &mut sub_context(ctx, ix))?;
                }
                Ok(())
            }
            Trigger::AfterEach(triggers) => {
                ctx.clear_state(INDEX_TAG)?;
                for (ix, t) in triggers.iter().enumerate() {
                    t.reset(window, &mut sub_context(ctx, ix))?;
                }
                Ok(())
            }
        }
    }
}

fn sub_context(ctx: &mut dyn TriggerContext, ix: usize) -> NestedContext<'_> {
    NestedContext::new(ctx, format!("{ix}/"))
}

fn is_late(ctx: &dyn TriggerContext, has_late: bool) -> Result<bool> {
    Ok(has_late && ctx.get_state(IS_LATE_TAG, Combine::Max)?.unwrap_or(0) > 0)
}

fn current_index(ctx: &dyn TriggerContext) -> Result<usize> {
    Ok(ctx.get_state(INDEX_TAG, Combine::Max)?.unwrap_or(0).max(0) as usize)
}
