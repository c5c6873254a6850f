use d3dvk_tracing::trace_span;
use slab::Slab;

use super::Region;

/// A binary buddy allocator over a single chunk of device memory.
///
/// Blocks are powers of two between `min_block_size` and the size of the
/// chunk. Freed blocks are merged with their buddy whenever the buddy is
/// free as well.
#[derive(Clone, Debug)]
pub struct BuddyAllocator {
    blocks: Slab<Block>,
    root: usize,
    stack: Vec<usize>,
    min_block_size: u64,
    used: u64,
}

impl BuddyAllocator {
    pub fn new(size: u64, min_block_size: u64) -> Self {
        assert!(size.is_power_of_two());
        assert!(min_block_size.is_power_of_two());
        assert!(min_block_size <= size);

        let mut blocks = Slab::new();
        let root = blocks.insert(Block {
            offset: 0,
            size,
            state: State::Free,
            parent: None,
        });

        Self {
            blocks,
            root,
            // While walking down the tree the stack holds at most one right
            // node per level plus the left node that is popped next.
            stack: Vec::with_capacity((size.ilog2() + 1) as usize),
            min_block_size,
            used: 0,
        }
    }

    /// Total size of the managed region.
    #[inline]
    pub fn size(&self) -> u64 {
        self.blocks[self.root].size
    }

    /// Number of bytes in used blocks.
    #[inline]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn alloc(&mut self, size: u64, align: u64) -> Option<Region> {
        let _span = trace_span!("BuddyAllocator::alloc").entered();

        debug_assert!(align.is_power_of_two());
        let size = size.max(self.min_block_size).checked_next_power_of_two()?;

        self.stack.clear();
        self.stack.push(self.root);

        while let Some(index) = self.stack.pop() {
            let block = &mut self.blocks[index];

            if size > block.size {
                continue;
            }

            match block.state {
                State::Free => (),
                State::Used => continue,
                State::Split { left, right } => {
                    // Smaller allocations stay on the left. The right half
                    // starts at `offset + size / 2` and is only usable if
                    // that offset is aligned.
                    if (block.offset + block.size / 2) % align == 0 {
                        self.stack.push(right);
                    }

                    self.stack.push(left);
                    continue;
                }
            }

            if block.offset % align != 0 {
                continue;
            }

            if block.size == size {
                block.state = State::Used;
                self.used += block.size;

                return Some(Region {
                    offset: block.offset,
                    size: block.size,
                });
            }

            let left = Block {
                offset: block.offset,
                size: block.size / 2,
                state: State::Free,
                parent: Some(index),
            };
            let right = Block {
                offset: block.offset + block.size / 2,
                size: block.size / 2,
                state: State::Free,
                parent: Some(index),
            };

            let left = self.blocks.insert(left);
            let right = self.blocks.insert(right);
            self.blocks[index].state = State::Split { left, right };

            // Both halves fit `size` and the left one has the parent's
            // alignment.
            self.stack.push(left);
        }

        None
    }

    /// Frees the block starting at `offset`.
    ///
    /// Returns the size of the freed block or `None` if no block was
    /// allocated at `offset`.
    pub fn dealloc(&mut self, offset: u64) -> Option<u64> {
        let _span = trace_span!("BuddyAllocator::dealloc").entered();

        let mut index = self.root;
        loop {
            let block = &self.blocks[index];
            match block.state {
                State::Used if block.offset == offset => break,
                State::Split { left, right } => {
                    let mid = block.offset + block.size / 2;
                    index = if offset < mid { left } else { right };
                }
                _ => return None,
            }
        }

        let block = &mut self.blocks[index];
        block.state = State::Free;
        let size = block.size;
        self.used -= size;

        let mut parent = block.parent;
        while let Some(parent_index) = parent {
            let State::Split { left, right } = self.blocks[parent_index].state else {
                unreachable!("parent of a block must be split");
            };

            let other = if index == left { right } else { left };
            if !self.blocks[other].state.is_free() {
                break;
            }

            self.blocks.remove(left);
            self.blocks.remove(right);

            let block = &mut self.blocks[parent_index];
            block.state = State::Free;

            index = parent_index;
            parent = block.parent;
        }

        Some(size)
    }
}

#[derive(Copy, Clone, Debug)]
struct Block {
    offset: u64,
    size: u64,
    state: State,
    parent: Option<usize>,
}

#[derive(Copy, Clone, Debug)]
enum State {
    Free,
    Used,
    Split { left: usize, right: usize },
}

impl State {
    const fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }
}
