/// A source file index within one compilation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FileId(pub u16);

/// A source position: 1-based line and column at a token's start.
/// Every token and AST node carries one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pos {
    pub file: FileId,
    pub line: u32,
    pub col: u32,
}

impl Pos {
    pub fn new(file: FileId, line: u32, col: u32) -> Self {
        Self { file, line, col }
    }
}

impl Default for Pos {
    fn default() -> Self {
        Self {
            file: FileId(0),
            line: 1,
            col: 1,
        }
    }
}
