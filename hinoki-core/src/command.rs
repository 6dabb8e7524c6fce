//! デバッガコマンド

use crate::parse::parse_integer;

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 式中の変数を取り込み、永続変数に残す
    Capture(String),
    /// 永続変数の一覧
    Vars,
    /// 整数の永続変数を作る
    Set { name: String, value: u64 },
    /// 停止条件の設定（引数なしで解除）
    Condition(Option<String>),
    /// 実行継続
    Continue,
    /// ステップ実行
    Step,
    /// 現在の PC を表示
    Pc,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (head, rest) = match input.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (input, ""),
        };
        if head.is_empty() {
            return None;
        }

        match head {
            "expr" | "capture" | "p" => {
                if rest.is_empty() {
                    None
                } else {
                    Some(Command::Capture(rest.to_string()))
                }
            }
            "vars" | "v" => Some(Command::Vars),
            "set" => {
                let (name, value) = rest.split_once(char::is_whitespace)?;
                if !name.starts_with('$') || name.len() < 2 {
                    return None;
                }
                let value = parse_integer(value).ok()?;
                Some(Command::Set {
                    name: name.to_string(),
                    value,
                })
            }
            "condition" | "cond" => {
                let text = (!rest.is_empty()).then(|| rest.to_string());
                Some(Command::Condition(text))
            }
            "continue" | "c" => Some(Command::Continue),
            "step" | "s" => Some(Command::Step),
            "pc" => Some(Command::Pc),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
