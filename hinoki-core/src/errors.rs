//! エラー定義

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// DWARF情報がロードされていない場合のエラーメッセージ
pub const ERR_DWARF_NOT_LOADED: &str = "DWARF information not loaded";

/// 式の実体化・名前解決・評価のエラー
///
/// メッセージはそのまま「式を実行できなかった理由」としてユーザーに表示される。
/// ターゲットとの通信エラーは `reason` に文字列として埋め込む。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("Structure hasn't been laid out yet")]
    NotLaidOut,

    #[error("Couldn't lay out the struct: {0} has no size or alignment")]
    MissingLayoutInfo(String),

    #[error("Received null execution frame")]
    NullFrame,

    #[error("Couldn't find the process")]
    NoProcess,

    #[error("Couldn't get the register context to access {0}")]
    NoRegisterContext(String),

    #[error("Couldn't allocate {size} bytes for the materialized struct: {reason}")]
    Allocation { size: u64, reason: String },

    #[error("Couldn't deallocate the materialized struct at 0x{addr:x}: {reason}")]
    Deallocation { addr: u64, reason: String },

    #[error("{value} is too big to store in {register}")]
    RegisterTooSmall { value: String, register: String },

    #[error("Couldn't read {what} from the target: {reason}")]
    Read { what: String, reason: String },

    #[error("Couldn't write {what} to the target: {reason}")]
    Write { what: String, reason: String },

    #[error("Couldn't read {value} from {register}: {reason}")]
    RegisterRead {
        value: String,
        register: String,
        reason: String,
    },

    #[error("Couldn't write {value} to {register}: {reason}")]
    RegisterWrite {
        value: String,
        register: String,
        reason: String,
    },

    #[error("Couldn't find {0} with appropriate type")]
    VariableNotFound(String),

    #[error("Couldn't get value for {0}")]
    NoValue(String),

    #[error("Unexpected variable {0}")]
    UnexpectedVariable(String),

    #[error("No materialized location")]
    NotMaterialized,

    #[error("Couldn't load '{0}' because the context is incomplete")]
    IncompleteContext(String),

    #[error("Couldn't load '{0}' because its type is unknown")]
    UnknownObjectType(String),

    #[error("Couldn't find '{0}' with appropriate type in scope")]
    ObjectNotFound(String),

    #[error("Couldn't read '{name}' from the target: {reason}")]
    ObjectRead { name: String, reason: String },

    #[error("Couldn't get the location for '{0}'")]
    NoLocation(String),

    #[error("'{0}' is not of an expected pointer size")]
    PointerSize(String),

    #[error("'{0}' is in a register, not in memory")]
    NotInMemory(String),

    #[error("Persistent variable {0} already exists")]
    DuplicatePersistent(String),

    #[error("Couldn't find a type for {0} in the scratch context")]
    TypeCopy(String),

    #[error("Couldn't parse the expression: {0}")]
    Parse(String),

    #[error("Couldn't execute the expression: {0}")]
    Execution(String),

    #[error("Expression produced no result")]
    NoResult,
}

/// 式評価の結果型
pub type ExprResult<T> = std::result::Result<T, ExprError>;
