//! シンボル解決機能

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    /// ファイル上のアドレス
    pub address: u64,
    pub size: u64,
    /// 外部リンケージを持つか
    pub external: bool,
    /// コードを指すシンボルか
    pub is_function: bool,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64, external: bool, is_function: bool) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
            external,
            is_function,
        }
    }

    /// 表示用の名前を取得（デマングル可能ならデマングル後、できなければマングル名）
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }

    /// 名前が一致するか
    ///
    /// マングル名、デマングル名、デマングル名の末尾のパス要素のいずれかと比較する。
    pub fn matches(&self, name: &str) -> bool {
        self.name == name
            || self.demangled_name == name
            || self.demangled_name.rsplit("::").next() == Some(name)
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順のシンボル
    symbols_by_address: Vec<Symbol>,
}

impl SymbolResolver {
    /// DWARFローダーからシンボル解決を作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        Ok(Self::from_symbols(loader.object_file().symbols().filter_map(
            |symbol| {
                let name = symbol.name().ok().filter(|name| !name.is_empty())?;
                Some(Symbol::new(
                    name.to_string(),
                    symbol.address(),
                    symbol.size(),
                    symbol.is_global(),
                    symbol.kind() == SymbolKind::Text,
                ))
            },
        )))
    }

    /// シンボルの列から作成する
    pub fn from_symbols(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        let mut symbols_by_name = HashMap::new();
        let mut symbols_by_address = Vec::new();

        for sym in symbols {
            symbols_by_name.insert(sym.name.clone(), sym.clone());
            symbols_by_address.push(sym);
        }
        symbols_by_address.sort_by_key(|s| s.address);

        Self {
            symbols_by_name,
            symbols_by_address,
        }
    }

    /// シンボル名からアドレスを解決する
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.symbols_by_name.get(symbol).map(|s| s.address)
    }

    /// アドレスからシンボルを解決する（最も近いシンボルを返す）
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = match self
            .symbols_by_address
            .binary_search_by_key(&addr, |s| s.address)
        {
            Ok(idx) => return self.symbols_by_address.get(idx),
            Err(0) => return None,
            Err(idx) => idx - 1,
        };

        let sym = &self.symbols_by_address[idx];
        if sym.size == 0 || addr < sym.address + sym.size {
            Some(sym)
        } else {
            None
        }
    }

    /// 名前が一致するコードシンボルを検索する
    pub fn functions_named(&self, name: &str) -> Vec<&Symbol> {
        self.symbols_by_address
            .iter()
            .filter(|s| s.is_function && s.matches(name))
            .collect()
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols_by_address.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SymbolResolver {
        SymbolResolver::from_symbols(vec![
            Symbol::new("main".to_string(), 0x1000, 0x40, true, true),
            Symbol::new("helper".to_string(), 0x1040, 0x10, false, true),
            Symbol::new("_ZN4demo5count17h0123456789abcdefE".to_string(), 0x2000, 8, true, false),
        ])
    }

    #[test]
    fn test_resolve_and_reverse() {
        let resolver = resolver();
        assert_eq!(resolver.resolve("main"), Some(0x1000));
        assert_eq!(resolver.reverse_resolve(0x1044).unwrap().name, "helper");
        assert!(resolver.reverse_resolve(0x1050).is_none());
        assert!(resolver.reverse_resolve(0x10).is_none());
    }

    #[test]
    fn test_functions_named_uses_demangled_path() {
        let resolver = resolver();
        let found = resolver.functions_named("helper");
        assert_eq!(found.len(), 1);
        assert!(!found[0].external);

        // データシンボルは関数として返さない
        assert!(resolver.functions_named("count").is_empty());
        let data = resolver.all_symbols().find(|s| !s.is_function).unwrap();
        assert_eq!(data.display_name(), "demo::count");
        assert!(data.matches("count"));
    }
}
