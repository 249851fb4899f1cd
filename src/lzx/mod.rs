use std::convert::TryFrom;

use num_enum::TryFromPrimitive;

use crate::errors::{Error, Result};

pub mod bitstream;

use self::bitstream::Bitstream;

pub const FRAME_SIZE: usize = 32768;

const MIN_MATCH: usize = 2;
const NUM_CHARS: usize = 256;
const NUM_PRIMARY_LENGTHS: usize = 7;
// The length tree carries 249 delta-coded elements in a 250-symbol table.
const NUM_SECONDARY_LENGTHS: usize = 249;

const PRETREE_NUM_ELEMENTS: usize = 20;
const ALIGNED_NUM_ELEMENTS: usize = 8;

const PRETREE_TABLEBITS: u32 = 6;
const MAINTREE_TABLEBITS: u32 = 12;
const LENGTH_TABLEBITS: u32 = 12;
const ALIGNED_TABLEBITS: u32 = 7;

// 256 literals plus 8 length headers for each of the up-to-51 position slots.
const MAINTREE_MAXSYMBOLS: usize = NUM_CHARS + 51 * 8;
const LENGTH_MAXSYMBOLS: usize = NUM_SECONDARY_LENGTHS + 1;

lazy_static! {
    // Two position slots per extra-bit count, starting at zero and capping
    // at 17 extra bits from slot 36 onward.
    static ref EXTRA_BITS: [u8; 51] = {
        let mut eb = [0u8; 51];
        let mut j: u8 = 0;
        let mut i: usize = 0;

        while i <= 50 {
            eb[i] = j;
            if i + 1 <= 50 {
                eb[i + 1] = j;
            }
            if i != 0 && j < 17 {
                j += 1;
            }
            i += 2;
        }

        eb
    };

    // Cumulative bases derived from the extra-bit schedule.
    static ref POSITION_BASE: [u32; 51] = {
        let mut pb = [0u32; 51];
        let mut j: u32 = 0;

        for i in 0..51 {
            pb[i] = j;
            j += 1 << EXTRA_BITS[i];
        }

        pb
    };
}

#[derive(Debug, Clone, Copy, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum BlockType {
    Verbatim = 1,
    Aligned = 2,
    Uncompressed = 3,
}

// Canonical Huffman decoder over a direct-lookup table. Codes no longer than
// `tablebits` resolve in one probe; longer codes continue through a binary
// tree overlay appended past the direct entries.
struct Tree {
    tablebits: u32,
    maxsymbols: usize,
    lens: Vec<u8>,
    table: Vec<u16>,
}

const TABLE_UNUSED: u16 = 0xFFFF;

impl Tree {
    fn new(maxsymbols: usize, tablebits: u32) -> Self {
        Self {
            tablebits,
            maxsymbols,
            lens: vec![0u8; maxsymbols],
            table: vec![0u16; (1 << tablebits) + maxsymbols * 2],
        }
    }

    fn clear_lens(&mut self) {
        for l in self.lens.iter_mut() {
            *l = 0;
        }
    }

    // Builds the decode table from `self.lens`. A table whose code space is
    // not exactly filled is accepted only when every length is zero (the
    // degenerate never-used tree); anything else is a corrupt header.
    fn build(&mut self) -> Result<()> {
        let nsyms = self.maxsymbols;
        let nbits = self.tablebits;

        let mut pos: u32 = 0;
        let mut table_mask: u32 = 1 << nbits;
        let mut bit_mask: u32 = table_mask >> 1;

        // Codes short enough for the direct lookup.
        for bit_num in 1..=nbits {
            for sym in 0..nsyms {
                if self.lens[sym] as u32 != bit_num {
                    continue;
                }

                let leaf = pos as usize;
                pos += bit_mask;
                if pos > table_mask {
                    return Err(Error::BadHuffmanTable);
                }

                for fill in 0..bit_mask as usize {
                    self.table[leaf + fill] = sym as u16;
                }
            }
            bit_mask >>= 1;
        }

        if pos == table_mask {
            return Ok(());
        }

        for entry in self.table[pos as usize..table_mask as usize].iter_mut() {
            *entry = TABLE_UNUSED;
        }

        // Longer codes grow a node pair per unexplored branch.
        let mut next_symbol = if (table_mask >> 1) < nsyms as u32 {
            nsyms
        } else {
            (table_mask >> 1) as usize
        };

        pos <<= 16;
        table_mask <<= 16;
        bit_mask = 1 << 15;

        for bit_num in (nbits + 1)..=16 {
            for sym in 0..nsyms {
                if self.lens[sym] as u32 != bit_num {
                    continue;
                }
                if pos >= table_mask {
                    return Err(Error::BadHuffmanTable);
                }

                let mut leaf = (pos >> 16) as usize;
                for fill in 0..(bit_num - nbits) {
                    if self.table[leaf] == TABLE_UNUSED {
                        if next_symbol * 2 + 1 >= self.table.len() {
                            return Err(Error::BadHuffmanTable);
                        }
                        self.table[next_symbol * 2] = TABLE_UNUSED;
                        self.table[next_symbol * 2 + 1] = TABLE_UNUSED;
                        self.table[leaf] = next_symbol as u16;
                        next_symbol += 1;
                    }

                    leaf = (self.table[leaf] as usize) << 1;
                    if (pos >> (15 - fill)) & 1 != 0 {
                        leaf += 1;
                    }
                }

                self.table[leaf] = sym as u16;
                pos += bit_mask;
            }
            bit_mask >>= 1;
        }

        if pos == table_mask {
            return Ok(());
        }

        if self.lens.iter().all(|&l| l == 0) {
            Ok(())
        } else {
            Err(Error::BadHuffmanTable)
        }
    }

    fn decode(&self, bs: &mut Bitstream) -> Result<usize> {
        bs.ensure_bits(16);

        let mut sym = self.table[bs.peek_bits(self.tablebits) as usize] as usize;
        if sym >= self.maxsymbols {
            let mut width = self.tablebits;
            loop {
                width += 1;
                if width > 16 {
                    return Err(Error::BadHuffmanTable);
                }

                let bit = (bs.peek_bits(width) & 1) as usize;
                sym = self.table[(sym << 1) | bit] as usize;
                if sym < self.maxsymbols {
                    break;
                }
            }
        }

        let len = self.lens[sym] as u32;
        if len == 0 {
            return Err(Error::BadHuffmanTable);
        }
        bs.remove_bits(len);

        Ok(sym)
    }

    // Reads a 20-element pretree (4-bit lengths) from the stream, then
    // applies the delta/run-length coded update to `lens[first..last)`:
    //   0..=16  -> new = (prev - z) mod 17
    //   17      -> 4 bits + 4 zero slots
    //   18      -> 5 bits + 20 zero slots
    //   19      -> 1 bit + 4 repeats of a freshly decoded delta
    fn update_lengths(
        &mut self,
        bs: &mut Bitstream,
        lens: &mut [u8],
        first: usize,
        last: usize,
    ) -> Result<()> {
        for x in 0..PRETREE_NUM_ELEMENTS {
            self.lens[x] = bs.read_bits(4) as u8;
        }
        self.build()?;

        let mut x = first;
        while x < last {
            let z = self.decode(bs)?;
            match z {
                17 => {
                    let run = bs.read_bits(4) as usize + 4;
                    if x + run > last {
                        return Err(Error::BadHuffmanTable);
                    }
                    for _ in 0..run {
                        lens[x] = 0;
                        x += 1;
                    }
                }
                18 => {
                    let run = bs.read_bits(5) as usize + 20;
                    if x + run > last {
                        return Err(Error::BadHuffmanTable);
                    }
                    for _ in 0..run {
                        lens[x] = 0;
                        x += 1;
                    }
                }
                19 => {
                    let run = bs.read_bits(1) as usize + 4;
                    if x + run > last {
                        return Err(Error::BadHuffmanTable);
                    }

                    let z = self.decode(bs)?;
                    if z > 16 {
                        return Err(Error::BadHuffmanTable);
                    }
                    let value = ((17 + lens[x] as usize - z) % 17) as u8;
                    for _ in 0..run {
                        lens[x] = value;
                        x += 1;
                    }
                }
                z if z <= 16 => {
                    lens[x] = ((17 + lens[x] as usize - z) % 17) as u8;
                    x += 1;
                }
                _ => return Err(Error::BadHuffmanTable),
            }
        }

        Ok(())
    }
}

fn position_slots(window_bits: u32) -> usize {
    match window_bits {
        21 => 50,
        20 => 42,
        b => (b as usize) << 1,
    }
}

pub struct LzxDecoder {
    window: Vec<u8>,
    window_posn: usize,
    frame_posn: usize,
    frame: u32,
    reset_interval: u32,

    r0: u32,
    r1: u32,
    r2: u32,

    main_elements: usize,
    block_type: Option<BlockType>,
    block_length: u32,
    block_remaining: u32,
    header_read: bool,

    intel_filesize: i32,
    intel_curpos: i32,
    intel_started: bool,

    pretree: Tree,
    maintree: Tree,
    lengthtree: Tree,
    alignedtree: Tree,
}

impl LzxDecoder {
    pub fn new(window_bits: u32, reset_interval: u32) -> Result<Self> {
        if window_bits < 15 || window_bits > 21 {
            return Err(Error::BadWindowSize(
                1u32.checked_shl(window_bits).unwrap_or(0),
            ));
        }

        Ok(Self {
            window: vec![0u8; 1 << window_bits],
            window_posn: 0,
            frame_posn: 0,
            frame: 0,
            reset_interval,
            r0: 1,
            r1: 1,
            r2: 1,
            main_elements: NUM_CHARS + (position_slots(window_bits) << 3),
            block_type: None,
            block_length: 0,
            block_remaining: 0,
            header_read: false,
            intel_filesize: 0,
            intel_curpos: 0,
            intel_started: false,
            pretree: Tree::new(PRETREE_NUM_ELEMENTS, PRETREE_TABLEBITS),
            maintree: Tree::new(MAINTREE_MAXSYMBOLS, MAINTREE_TABLEBITS),
            lengthtree: Tree::new(LENGTH_MAXSYMBOLS, LENGTH_TABLEBITS),
            alignedtree: Tree::new(ALIGNED_NUM_ELEMENTS, ALIGNED_TABLEBITS),
        })
    }

    // Window size as stored in the container: a power of two between 32 KiB
    // and 2 MiB. Anything else is rejected up front.
    pub fn with_window_size(window: u32, reset_interval: u32) -> Result<Self> {
        if window == 0 || !window.is_power_of_two() {
            return Err(Error::BadWindowSize(window));
        }

        Self::new(window.trailing_zeros(), reset_interval)
    }

    fn reset_state(&mut self) {
        debug_assert_eq!(self.block_remaining, 0);

        self.r0 = 1;
        self.r1 = 1;
        self.r2 = 1;
        self.header_read = false;
        self.block_type = None;
        self.block_length = 0;
        self.block_remaining = 0;
        self.maintree.clear_lens();
        self.lengthtree.clear_lens();
    }

    pub fn repeated_offsets(&self) -> (u32, u32, u32) {
        (self.r0, self.r1, self.r2)
    }

    // Inflates `out_len` bytes from the assembled bitstream, one 32 KiB
    // frame at a time. State carries over between calls, so a stream may be
    // fed in several slices as long as slice bounds fall on frame bounds.
    pub fn decompress(&mut self, input: &[u8], out_len: usize) -> Result<Vec<u8>> {
        let mut bs = Bitstream::new(input);
        let mut out = Vec::with_capacity(out_len);

        while out.len() < out_len {
            if bs.is_overrun() {
                return Err(Error::Truncated);
            }

            if self.reset_interval != 0 && self.frame % self.reset_interval == 0 {
                self.reset_state();
            }

            let frame_size = FRAME_SIZE.min(out_len - out.len());

            // One optional bit per stream: a set bit carries the 32-bit
            // Intel translation size as two 16-bit halves.
            if !self.header_read {
                self.intel_filesize = if bs.read_bit() != 0 {
                    let hi = bs.read_bits(16);
                    let lo = bs.read_bits(16);
                    ((hi << 16) | lo) as i32
                } else {
                    0
                };
                self.header_read = true;
            }

            let produced = self.decode_frame(&mut bs, frame_size)?;
            if produced != frame_size {
                return Err(Error::MatchOverflowsWindow);
            }

            // Frames close on a 16-bit boundary.
            bs.align();

            let start = out.len();
            out.extend_from_slice(&self.window[self.frame_posn..self.frame_posn + frame_size]);

            self.postprocess_frame(&mut out[start..]);

            self.frame_posn = self.window_posn & (self.window.len() - 1);
            self.frame += 1;
        }

        Ok(out)
    }

    fn decode_frame(&mut self, bs: &mut Bitstream, frame_size: usize) -> Result<usize> {
        let mut todo = frame_size as i64;
        let mut produced: usize = 0;

        while todo > 0 {
            if self.block_remaining == 0 {
                self.read_block_header(bs)?;
            }

            let mut this_run = self.block_remaining as i64;
            if this_run > todo {
                this_run = todo;
            }
            todo -= this_run;
            self.block_remaining -= this_run as u32;

            self.window_posn &= self.window.len() - 1;
            if self.window_posn + this_run as usize > self.window.len() {
                return Err(Error::MatchOverflowsWindow);
            }

            let decoded = match self.block_type {
                Some(BlockType::Verbatim) => self.decode_run(bs, this_run, false)?,
                Some(BlockType::Aligned) => self.decode_run(bs, this_run, true)?,
                Some(BlockType::Uncompressed) => {
                    let len = this_run as usize;
                    let raw = bs.read_raw(len)?;
                    self.window[self.window_posn..self.window_posn + len].copy_from_slice(raw);
                    self.window_posn += len;
                    this_run
                }
                None => return Err(Error::BadBlockType(0)),
            };

            produced += decoded as usize;

            // The final match of a run may spill past the requested length;
            // the spill belongs to the same block.
            let over = decoded - this_run;
            if over > 0 {
                if over as u32 > self.block_remaining {
                    return Err(Error::MatchOverflowsWindow);
                }
                self.block_remaining -= over as u32;
            }
        }

        Ok(produced)
    }

    fn read_block_header(&mut self, bs: &mut Bitstream) -> Result<()> {
        // An odd-length uncompressed block is padded to the next word.
        if self.block_type == Some(BlockType::Uncompressed) {
            if self.block_length & 1 == 1 {
                bs.skip_byte();
            }
            bs.reset();
        }

        let raw_type = bs.read_bits(3) as u8;
        let ty = BlockType::try_from(raw_type).map_err(|_| {
            if bs.is_overrun() {
                Error::Truncated
            } else {
                Error::BadBlockType(raw_type)
            }
        })?;

        let hi = bs.read_bits(16);
        let lo = bs.read_bits(8);
        let size = (hi << 8) | lo;
        self.block_length = size;
        self.block_remaining = size;

        match ty {
            BlockType::Verbatim => self.read_trees(bs)?,
            BlockType::Aligned => {
                for x in 0..ALIGNED_NUM_ELEMENTS {
                    self.alignedtree.lens[x] = bs.read_bits(3) as u8;
                }
                self.alignedtree.build()?;
                self.read_trees(bs)?;
            }
            BlockType::Uncompressed => {
                // Can't rule translated calls out of raw data.
                self.intel_started = true;

                // Byte-align the cursor: give back a fully buffered word,
                // drop any padding bits.
                bs.ensure_bits(16);
                if bs.bits_left() > 16 {
                    bs.rewind_word();
                }
                bs.reset();

                let raw = bs.read_raw(12)?;
                self.r0 = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                self.r1 = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
                self.r2 = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
            }
        }

        self.block_type = Some(ty);
        Ok(())
    }

    fn read_trees(&mut self, bs: &mut Bitstream) -> Result<()> {
        let main_elements = self.main_elements;
        let Self {
            pretree,
            maintree,
            lengthtree,
            intel_started,
            ..
        } = self;

        pretree.update_lengths(bs, &mut maintree.lens, 0, NUM_CHARS)?;
        pretree.update_lengths(bs, &mut maintree.lens, NUM_CHARS, main_elements)?;
        maintree.build()?;

        // A reachable 0xE8 literal arms the call translator.
        if maintree.lens[0xE8] != 0 {
            *intel_started = true;
        }

        pretree.update_lengths(bs, &mut lengthtree.lens, 0, NUM_SECONDARY_LENGTHS)?;
        lengthtree.build()?;

        Ok(())
    }

    fn decode_run(&mut self, bs: &mut Bitstream, this_run: i64, aligned: bool) -> Result<i64> {
        let window_size = self.window.len();
        let Self {
            window,
            window_posn,
            r0,
            r1,
            r2,
            maintree,
            lengthtree,
            alignedtree,
            ..
        } = self;

        let mut run = this_run;
        while run > 0 {
            let main = maintree.decode(bs)?;

            if main < NUM_CHARS {
                window[*window_posn] = main as u8;
                *window_posn += 1;
                run -= 1;
                continue;
            }

            let main = main - NUM_CHARS;

            let mut match_length = main & NUM_PRIMARY_LENGTHS;
            if match_length == NUM_PRIMARY_LENGTHS {
                match_length += lengthtree.decode(bs)?;
            }
            match_length += MIN_MATCH;

            let position_slot = main >> 3;
            let match_offset = match position_slot {
                0 => *r0 as usize,
                1 => {
                    std::mem::swap(r0, r1);
                    *r0 as usize
                }
                2 => {
                    std::mem::swap(r0, r2);
                    *r0 as usize
                }
                _ => {
                    let offset = if aligned {
                        let extra = EXTRA_BITS[position_slot] as u32;
                        let mut offset = POSITION_BASE[position_slot] as usize - 2;

                        if extra > 3 {
                            offset += (bs.read_bits(extra - 3) as usize) << 3;
                            offset += alignedtree.decode(bs)?;
                        } else if extra == 3 {
                            offset += alignedtree.decode(bs)?;
                        } else if extra > 0 {
                            offset += bs.read_bits(extra) as usize;
                        } else {
                            offset = 1;
                        }

                        offset
                    } else if position_slot == 3 {
                        1
                    } else {
                        let extra = EXTRA_BITS[position_slot] as u32;
                        let verbatim = bs.read_bits(extra) as usize;
                        POSITION_BASE[position_slot] as usize - 2 + verbatim
                    };

                    *r2 = *r1;
                    *r1 = *r0;
                    *r0 = offset as u32;

                    offset
                }
            };

            copy_match(window, window_posn, window_size, match_offset, match_length)?;
            run -= match_length as i64;
        }

        Ok(this_run - run)
    }

    // Rewrites x86 relative CALL operands back to their on-disk form. Only
    // the emitted copy is touched; the window keeps the decoded bytes for
    // future matches.
    fn postprocess_frame(&mut self, frame: &mut [u8]) {
        if self.intel_filesize == 0 {
            return;
        }

        if !self.intel_started || self.frame > 32768 || frame.len() <= 10 {
            self.intel_curpos += frame.len() as i32;
            return;
        }

        let filesize = self.intel_filesize;
        let mut curpos = self.intel_curpos;
        self.intel_curpos += frame.len() as i32;

        let end = frame.len() - 10;
        let mut pos = 0usize;
        while pos < end {
            if frame[pos] != 0xE8 {
                curpos += 1;
                pos += 1;
                continue;
            }

            let abs = i32::from_le_bytes([
                frame[pos + 1],
                frame[pos + 2],
                frame[pos + 3],
                frame[pos + 4],
            ]);

            if abs >= -curpos && abs < filesize {
                let rel = if abs >= 0 { abs - curpos } else { abs + filesize };
                frame[pos + 1..pos + 5].copy_from_slice(&rel.to_le_bytes());
            }

            pos += 5;
            curpos += 5;
        }
    }
}

// LZ77 copy inside the ring. Offsets larger than the write position reach
// back past the wrap point.
fn copy_match(
    window: &mut [u8],
    window_posn: &mut usize,
    window_size: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    if offset == 0 || offset > window_size {
        return Err(Error::MatchOverflowsWindow);
    }
    if *window_posn + length > window_size {
        return Err(Error::MatchOverflowsWindow);
    }

    let mut dest = *window_posn;

    if offset > dest {
        let mut src = window_size - (offset - dest);
        let mut remaining = length;

        let before_wrap = remaining.min(window_size - src);
        for _ in 0..before_wrap {
            window[dest] = window[src];
            dest += 1;
            src += 1;
        }
        remaining -= before_wrap;

        src = 0;
        for _ in 0..remaining {
            window[dest] = window[src];
            dest += 1;
            src += 1;
        }
    } else {
        let mut src = dest - offset;
        for _ in 0..length {
            window[dest] = window[src];
            dest += 1;
            src += 1;
        }
    }

    *window_posn = dest;
    Ok(())
}
