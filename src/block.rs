// A (piece, offset, length) sub-range of a piece, as carried by the
// request, piece and cancel messages.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {
    pub index: u32,

    pub begin: u32,

    pub length: u32,
}

impl std::fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "block {{ piece idx: {}, offset: {}, length: {} }}",
            self.index, self.begin, self.length
        )
    }
}
