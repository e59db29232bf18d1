mod negotiator;

pub use negotiator::{ClientCodec, ServerCodec, RENEGOTIATE_DELAY};

const SYMBOLS: usize = 256;
const MAX_NODES: usize = SYMBOLS * 2 - 1;
const HISTOGRAM_LIMIT: u32 = 65000;

/// Bytes the encoder keeps free at the end of its output before every
/// symbol, enough for the longest code plus the terminator.
pub const COMPRESS_MARGIN: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("codec output would exceed {0} bytes")]
    OutputOverflow(usize),
    #[error("bitstream fell off the huffman tree")]
    FellOffTree,
}

#[derive(Debug, Clone, Copy, Default)]
struct Symbol {
    count: u32,
    code: u32,
    bits: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    symbol: Option<u8>,
    count: u32,
    child_a: usize,
    child_b: usize,
}

/// Huffman coder driven by a running byte histogram.
///
/// Every byte value starts with a count of one, so any input can be encoded
/// regardless of what was observed. The tree is rebuilt lazily on the first
/// `compress`/`decompress` after `extend` changed the histogram.
#[derive(Debug, Clone)]
pub struct AdaptiveHuffman {
    symbols: [Symbol; SYMBOLS],
    nodes: [Node; MAX_NODES],
    root: usize,
    total_count: u32,
    fresh_histogram: bool,
}

impl Default for AdaptiveHuffman {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveHuffman {
    pub fn new() -> Self {
        let mut codec = Self {
            symbols: [Symbol::default(); SYMBOLS],
            nodes: [Node::default(); MAX_NODES],
            root: 0,
            total_count: 0,
            fresh_histogram: true,
        };
        codec.reset();
        codec
    }

    pub fn reset(&mut self) {
        for sym in self.symbols.iter_mut() {
            *sym = Symbol {
                count: 1,
                code: 0,
                bits: 0,
            };
        }
        self.total_count = SYMBOLS as u32;
        self.fresh_histogram = true;
    }

    pub fn total_count(&self) -> u32 {
        self.total_count
    }

    pub fn count(&self, symbol: u8) -> u32 {
        self.symbols[symbol as usize].count
    }

    /// Adds observed bytes to the histogram, then halves every count until
    /// the total is back under the limit. A count never drops below one.
    pub fn extend(&mut self, data: &[u8]) {
        for &b in data {
            self.symbols[b as usize].count += 1;
        }
        self.total_count += data.len() as u32;

        while self.total_count > HISTOGRAM_LIMIT {
            self.total_count = 0;
            for sym in self.symbols.iter_mut() {
                sym.count = (sym.count / 2).max(1);
                self.total_count += sym.count;
            }
        }

        self.fresh_histogram = true;
    }

    /// Code length in bits currently assigned to `symbol`.
    pub fn code_length(&mut self, symbol: u8) -> u32 {
        self.ensure_tree();
        self.symbols[symbol as usize].bits
    }

    fn ensure_tree(&mut self) {
        if self.fresh_histogram {
            self.make_tree();
            self.fresh_histogram = false;
        }
    }

    fn make_tree(&mut self) {
        let mut num_symbols = 0;
        for (k, sym) in self.symbols.iter().enumerate() {
            if sym.count > 0 {
                self.nodes[num_symbols] = Node {
                    symbol: Some(k as u8),
                    count: sym.count,
                    child_a: 0,
                    child_b: 0,
                };
                num_symbols += 1;
            }
        }

        let mut nodes_left = num_symbols;
        let mut next_idx = num_symbols;
        let mut root = None;

        while nodes_left > 1 {
            let mut node_1: Option<usize> = None;
            let mut node_2: Option<usize> = None;

            // Later nodes win ties; the resulting tree shape is part of the
            // wire format.
            for k in 0..next_idx {
                let count = self.nodes[k].count;
                if count == 0 {
                    continue;
                }
                match node_1 {
                    Some(n1) if count > self.nodes[n1].count => match node_2 {
                        Some(n2) if count > self.nodes[n2].count => {}
                        _ => node_2 = Some(k),
                    },
                    _ => {
                        node_2 = node_1;
                        node_1 = Some(k);
                    }
                }
            }

            let (Some(a), Some(b)) = (node_1, node_2) else {
                break;
            };

            self.nodes[next_idx] = Node {
                symbol: None,
                count: self.nodes[a].count + self.nodes[b].count,
                child_a: a,
                child_b: b,
            };
            self.nodes[a].count = 0;
            self.nodes[b].count = 0;
            root = Some(next_idx);
            next_idx += 1;
            nodes_left -= 1;
        }

        match root {
            Some(root) => {
                self.root = root;
                self.store_tree(root, 0, 0);
            }
            None => {
                self.root = 0;
                self.store_tree(0, 0, 1);
            }
        }
    }

    fn store_tree(&mut self, node: usize, code: u32, bits: u32) {
        let Node {
            symbol,
            child_a,
            child_b,
            ..
        } = self.nodes[node];

        if let Some(symbol) = symbol {
            let sym = &mut self.symbols[symbol as usize];
            sym.code = code;
            sym.bits = bits;
            return;
        }

        self.store_tree(child_a, code << 1, bits + 1);
        self.store_tree(child_b, (code << 1) | 1, bits + 1);
    }

    /// Encodes `input` into at most `max_len` bytes.
    ///
    /// A partial final byte is padded with the prefix of a code longer than
    /// the free bits, so the decoder runs out of input inside the tree
    /// instead of emitting a phantom symbol.
    pub fn compress(&mut self, input: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_tree();

        let mut writer = BitWriter::with_capacity(input.len());
        for &b in input {
            if writer.byte_pos() + COMPRESS_MARGIN >= max_len {
                return Err(CodecError::OutputOverflow(max_len));
            }
            let sym = &self.symbols[b as usize];
            writer.write_bits(sym.code, sym.bits);
        }

        let mut len = writer.byte_pos();
        if writer.bit_pos() > 0 {
            let left = 8 - writer.bit_pos();
            if let Some(term) = self.symbols.iter().find(|s| s.bits > left) {
                writer.write_bits(term.code, term.bits);
            }
            len += 1;
        }

        let mut out = writer.finish();
        out.truncate(len);
        Ok(out)
    }

    /// Decodes `input` into at most `max_len` bytes.
    pub fn decompress(&mut self, input: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_tree();

        let total_bits = input.len() * 8;
        let mut bit = 0usize;
        let mut out = Vec::with_capacity(max_len.min(input.len() * 4));

        loop {
            let mut node = self.root;
            let mut depth = 0u32;

            while self.nodes[node].symbol.is_none() && bit < total_bits {
                let set = input[bit / 8] & (0x80 >> (bit % 8)) != 0;
                node = if set {
                    self.nodes[node].child_b
                } else {
                    self.nodes[node].child_a
                };
                bit += 1;
                depth += 1;
            }

            match self.nodes[node].symbol {
                Some(symbol) => {
                    if out.len() >= max_len {
                        return Err(CodecError::OutputOverflow(max_len));
                    }
                    out.push(symbol);
                }
                // The terminator never fills a whole byte.
                None if depth >= 8 => return Err(CodecError::FellOffTree),
                None => return Ok(out),
            }
        }
    }
}

struct BitWriter {
    bytes: Vec<u8>,
    bit: u32,
}

impl BitWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            bit: 0,
        }
    }

    fn byte_pos(&self) -> usize {
        if self.bit == 0 {
            self.bytes.len()
        } else {
            self.bytes.len() - 1
        }
    }

    fn bit_pos(&self) -> u32 {
        self.bit
    }

    fn write_bits(&mut self, code: u32, bits: u32) {
        for i in (0..bits).rev() {
            if self.bit == 0 {
                self.bytes.push(0);
            }
            if code & (1 << i) != 0 {
                if let Some(last) = self.bytes.last_mut() {
                    *last |= 0x80 >> self.bit;
                }
            }
            self.bit = (self.bit + 1) & 7;
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..200u32 {
            data.extend_from_slice(&[0x80 | (i % 4) as u8, 0x02, (i % 7) as u8, 0, 0, 0x10]);
        }
        data
    }

    #[test]
    fn test_reset_histogram() {
        let mut codec = AdaptiveHuffman::new();
        codec.extend(b"hello");
        codec.reset();
        assert_eq!(codec.total_count(), 256);
        assert!((0..=255u8).all(|b| codec.count(b) == 1));
    }

    #[test]
    fn test_fresh_codec_uses_eight_bit_codes() {
        let mut codec = AdaptiveHuffman::new();
        assert!((0..=255u8).all(|b| codec.code_length(b) == 8));
    }

    #[test]
    fn test_roundtrip_fresh_codec() {
        let mut codec = AdaptiveHuffman::new();
        let input: Vec<u8> = (0..=255u8).collect();
        let packed = codec.compress(&input, 1200).unwrap();
        assert_eq!(packed.len(), 256);
        let unpacked = codec.decompress(&packed, 1200).unwrap();
        assert_eq!(unpacked, input);
    }

    #[test]
    fn test_roundtrip_adapted_codec() {
        let data = sample_payload();
        let mut codec = AdaptiveHuffman::new();
        codec.extend(&data);

        let input = &data[..300];
        let packed = codec.compress(input, 1200).unwrap();
        assert!(packed.len() < input.len());
        assert_eq!(codec.decompress(&packed, 1200).unwrap(), input);

        // Unseen bytes stay encodable.
        let odd = [0xFE, 0xED, 0xFA, 0xCE, 0x7F];
        let packed = codec.compress(&odd, 1200).unwrap();
        assert_eq!(codec.decompress(&packed, 1200).unwrap(), odd);
    }

    #[test]
    fn test_roundtrip_every_length() {
        let data = sample_payload();
        let mut codec = AdaptiveHuffman::new();
        codec.extend(&data);

        for len in 0..64 {
            let input = &data[..len];
            let packed = codec.compress(input, 1200).unwrap();
            assert_eq!(codec.decompress(&packed, 1200).unwrap(), input, "len {len}");
        }
    }

    #[test]
    fn test_histogram_is_bounded() {
        let mut codec = AdaptiveHuffman::new();
        let blob = vec![7u8; 70000];
        codec.extend(&blob);
        assert!(codec.total_count() <= 65000);
        assert!(codec.count(0) >= 1);
        assert!(codec.count(7) > codec.count(8));

        let packed = codec.compress(&[0, 7, 255], 1200).unwrap();
        assert_eq!(codec.decompress(&packed, 1200).unwrap(), vec![0, 7, 255]);
    }

    #[test]
    fn test_compress_output_overflow() {
        let mut codec = AdaptiveHuffman::new();
        let input = vec![0x42u8; 64];
        assert_eq!(
            codec.compress(&input, 40),
            Err(CodecError::OutputOverflow(40))
        );
        assert!(codec.compress(&input, 64 + COMPRESS_MARGIN + 1).is_ok());
    }

    #[test]
    fn test_decompress_output_overflow() {
        let mut codec = AdaptiveHuffman::new();
        let input = vec![1u8, 2, 3, 4, 5, 6];
        let packed = codec.compress(&input, 1200).unwrap();
        assert_eq!(
            codec.decompress(&packed, 4),
            Err(CodecError::OutputOverflow(4))
        );
        assert_eq!(codec.decompress(&packed, 6).unwrap(), input);
    }

    #[test]
    fn test_truncated_long_code_falls_off_tree() {
        let mut codec = AdaptiveHuffman::new();
        codec.extend(&vec![b'a'; 2000]);

        let rare = (0..=255u8)
            .find(|&b| codec.code_length(b) >= 9)
            .unwrap();

        let packed = codec.compress(&[rare], 1200).unwrap();
        assert!(packed.len() >= 2);
        assert_eq!(
            codec.decompress(&packed[..1], 1200),
            Err(CodecError::FellOffTree)
        );
    }

    #[test]
    fn test_terminator_is_not_decoded() {
        let mut codec = AdaptiveHuffman::new();
        codec.extend(&vec![b'a'; 2000]);
        assert!(codec.code_length(b'a') < 8);

        let packed = codec.compress(b"a", 1200).unwrap();
        assert_eq!(packed.len(), 1);
        assert_eq!(codec.decompress(&packed, 1200).unwrap(), b"a");
    }

    #[test]
    fn test_identical_histograms_agree() {
        let data = sample_payload();
        let mut sender = AdaptiveHuffman::new();
        let mut receiver = AdaptiveHuffman::new();
        sender.extend(&data);
        receiver.extend(&data);

        let packed = sender.compress(&data[..100], 1200).unwrap();
        assert_eq!(receiver.decompress(&packed, 1200).unwrap(), &data[..100]);
    }
}
