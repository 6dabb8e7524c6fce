//! デバッガセッション
//!
//! 評価をまたいで残る状態（永続変数、スクラッチ型コンテキスト、型コンテキストIDの払い出し）を
//! まとめて所有します。グローバルな状態は持たず、このオブジェクトを明示的に渡します。

use crate::persistent::PersistentVariables;
use hinoki_dwarf::{ContextId, TypeContext};

/// スクラッチ型コンテキストのID
pub const SCRATCH_CONTEXT: ContextId = ContextId(0);

/// デバッガセッション
#[derive(Debug)]
pub struct Session {
    persistent: PersistentVariables,
    scratch: TypeContext,
    next_context: u32,
}

impl Session {
    pub fn new() -> Self {
        Self {
            persistent: PersistentVariables::new(),
            scratch: TypeContext::new(SCRATCH_CONTEXT),
            next_context: SCRATCH_CONTEXT.0 + 1,
        }
    }

    /// 新しい型コンテキストIDを払い出す
    pub fn allocate_context_id(&mut self) -> ContextId {
        let id = ContextId(self.next_context);
        self.next_context += 1;
        id
    }

    pub fn persistent_variables(&self) -> &PersistentVariables {
        &self.persistent
    }

    pub fn persistent_variables_mut(&mut self) -> &mut PersistentVariables {
        &mut self.persistent
    }

    /// 永続変数の型を置くコンテキスト
    pub fn scratch_types(&self) -> &TypeContext {
        &self.scratch
    }

    pub fn scratch_types_mut(&mut self) -> &mut TypeContext {
        &mut self.scratch
    }

    /// 永続変数とスクラッチ型コンテキストを同時に借用する
    pub fn split_mut(&mut self) -> (&mut PersistentVariables, &mut TypeContext) {
        (&mut self.persistent, &mut self.scratch)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
