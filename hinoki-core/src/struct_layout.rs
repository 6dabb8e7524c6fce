//! 引数構造体のレイアウト
//!
//! 式から参照された値をすべて1つの構造体に詰めるためのオフセットを計算します。
//! メンバは追加順に並べ、各オフセットはそのメンバのアラインメントの倍数に切り上げます。
//! 構造体全体のアラインメントは最初のメンバのアラインメントです（最大値ではない）。

/// レイアウト済み構造体の情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructInfo {
    pub num_elements: usize,
    pub size: u64,
    pub alignment: u64,
}

/// メンバのサイズとアラインメント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSpec {
    pub size: u64,
    pub alignment: u64,
}

/// レイアウト結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub offsets: Vec<u64>,
    pub info: StructInfo,
}

/// `value` を `alignment` の倍数に切り上げる
pub fn align_up(value: u64, alignment: u64) -> u64 {
    match value % alignment {
        0 => value,
        rem => value + (alignment - rem),
    }
}

/// レイアウトを計算する
///
/// アラインメントが0のメンバがあれば、そのインデックスを `Err` で返す。
pub fn compute_layout(members: &[MemberSpec]) -> Result<Layout, usize> {
    let mut offsets = Vec::with_capacity(members.len());
    let mut cursor = 0u64;

    for (index, member) in members.iter().enumerate() {
        if member.alignment == 0 {
            return Err(index);
        }
        cursor = align_up(cursor, member.alignment);
        offsets.push(cursor);
        cursor += member.size;
    }

    let alignment = members.first().map(|m| m.alignment).unwrap_or(1);

    Ok(Layout {
        offsets,
        info: StructInfo {
            num_elements: members.len(),
            size: cursor,
            alignment,
        },
    })
}
