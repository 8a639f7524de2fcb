use crate::BlockId;
use indexmap::IndexSet;
use rustc_hash::FxBuildHasher;

type PageBlocks = IndexSet<BlockId, FxBuildHasher>;

/// For each RAM code page, the valid blocks overlapping it.
pub struct PageIndex {
    pages: Box<[PageBlocks]>,
}

impl PageIndex {
    pub fn new(page_count: u32) -> Self {
        Self {
            pages: (0..page_count)
                .map(|_| PageBlocks::with_hasher(FxBuildHasher))
                .collect(),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Blocks overlapping the given page.
    #[inline(always)]
    pub fn blocks(&self, page: u32) -> &PageBlocks {
        &self.pages[page as usize]
    }

    /// Whether any block overlaps the given page.
    #[inline(always)]
    pub fn is_tracked(&self, page: u32) -> bool {
        self.pages
            .get(page as usize)
            .is_some_and(|blocks| !blocks.is_empty())
    }

    /// Adds a block to a page. Returns whether the page was previously empty.
    pub fn insert(&mut self, page: u32, id: BlockId) -> bool {
        let blocks = &mut self.pages[page as usize];
        let was_empty = blocks.is_empty();
        blocks.insert(id);

        was_empty
    }

    /// Removes a block from a page. Returns whether the page became empty.
    pub fn remove(&mut self, page: u32, id: BlockId) -> bool {
        let blocks = &mut self.pages[page as usize];
        blocks.swap_remove(&id) && blocks.is_empty()
    }

    pub fn clear(&mut self) {
        for blocks in &mut self.pages {
            blocks.clear();
        }
    }

    /// Iterator over the pages with at least one block.
    pub fn tracked_pages(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, blocks)| !blocks.is_empty())
            .map(|(page, _)| page as u32)
    }
}

impl std::fmt::Debug for PageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageIndex")
            .field("pages", &self.pages.len())
            .field("tracked", &self.tracked_pages().count())
            .finish()
    }
}
