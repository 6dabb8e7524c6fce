//! DWARF解析のユーティリティ関数

use gimli::Reader;

/// DIEの名前を取得する
///
/// `.debug_str` などへの参照も解決する。
pub fn die_name<R: Reader>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Option<String> {
    let attr = entry.attr_value(gimli::DW_AT_name).ok()??;
    let name = dwarf.attr_string(unit, attr).ok()?;
    let name = name.to_string_lossy().ok()?.into_owned();
    Some(name)
}

/// DIEのリンケージ名（マングル名）を取得する
pub fn die_linkage_name<R: Reader>(
    dwarf: &gimli::Dwarf<R>,
    unit: &gimli::Unit<R>,
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Option<String> {
    let attr = entry
        .attr_value(gimli::DW_AT_linkage_name)
        .ok()
        .flatten()
        .or_else(|| entry.attr_value(gimli::DW_AT_MIPS_linkage_name).ok().flatten())?;
    let name = dwarf.attr_string(unit, attr).ok()?;
    let name = name.to_string_lossy().ok()?.into_owned();
    Some(name)
}

/// DW_AT_type の参照先を取得する
pub fn die_type<R: Reader>(
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Option<gimli::UnitOffset<R::Offset>> {
    match entry.attr_value(gimli::DW_AT_type).ok()?? {
        gimli::AttributeValue::UnitRef(offset) => Some(offset),
        _ => None,
    }
}

/// 符号なし定数の属性を取得する
pub fn die_udata<R: Reader>(
    entry: &gimli::DebuggingInformationEntry<R>,
    name: gimli::DwAt,
) -> Option<u64> {
    entry.attr_value(name).ok()??.udata_value()
}

/// フラグ属性を取得する
pub fn die_flag<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>, name: gimli::DwAt) -> bool {
    matches!(entry.attr_value(name), Ok(Some(gimli::AttributeValue::Flag(true))))
}

/// DIEのアドレス範囲 `[low, high)` を取得する
///
/// DW_AT_high_pc はアドレスとオフセットのどちらの形式も受け付ける。
pub fn pc_range<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>) -> Option<(u64, u64)> {
    let low = match entry.attr_value(gimli::DW_AT_low_pc).ok()?? {
        gimli::AttributeValue::Addr(addr) => addr,
        _ => return None,
    };

    let high = match entry.attr_value(gimli::DW_AT_high_pc).ok()?? {
        gimli::AttributeValue::Addr(addr) => addr,
        other => low + other.udata_value()?,
    };

    Some((low, high))
}
