//! ブレークポイント条件
//!
//! 条件式を評価して、停止すべきかを判定します。
//! 複数のスレッドが同じ場所で同時に止まることがあるため、
//! 1つの条件の評価はミューテックスで直列化します。

use crate::context::ExecutionContext;
use crate::errors::{ExprError, ExprResult};
use crate::expr_eval::{ExpressionEvaluator, ExpressionFrontend, ExpressionRunner};
use crate::session::Session;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// ブレークポイント条件
#[derive(Debug, Default)]
pub struct BreakpointCondition {
    text: Option<String>,
    hash: u64,
    lock: Mutex<()>,
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

impl BreakpointCondition {
    pub fn new(text: Option<&str>) -> Self {
        let mut condition = Self::default();
        condition.set_condition(text);
        condition
    }

    /// 条件を設定する。`None` または空文字列で条件を外す
    pub fn set_condition(&mut self, text: Option<&str>) {
        self.text = text
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        self.hash = self.text.as_deref().map(hash_text).unwrap_or(0);
    }

    pub fn condition_text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// 条件文字列のハッシュ（条件がなければ0）
    pub fn condition_hash(&self) -> u64 {
        self.hash
    }

    /// 条件を評価し、停止すべきなら `true`
    ///
    /// 条件がなければ評価せず `false`。結果の値が0以外なら停止。
    pub fn condition_says_stop(
        &self,
        session: &mut Session,
        frontend: &mut dyn ExpressionFrontend,
        runner: &mut dyn ExpressionRunner,
        exe_ctx: &ExecutionContext,
    ) -> ExprResult<bool> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(text) = self.text.as_deref() else {
            return Ok(false);
        };

        let outcome = ExpressionEvaluator::new(session).evaluate(text, frontend, runner, exe_ctx)?;
        let bytes = outcome.result_bytes.ok_or(ExprError::NoResult)?;
        let stop = bytes.iter().any(|&b| b != 0);

        debug!("condition '{}' evaluated to {}", text, if stop { "true" } else { "false" });
        Ok(stop)
    }
}
