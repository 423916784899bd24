//! Renders a plan into a fixed-budget token array plus its training mask.

use rand::RngCore;

use crate::element::{Element, FileId, Plan};
use crate::error::ProtocolError;
use crate::file_context::FileElement;
use crate::format::Format;
use crate::{Encoding, Token};

/// Arguments for one [`Packer::pack_context`] call.
#[derive(Debug, Clone)]
pub struct PackParams {
    /// Render `plan[start_from_plan_n..]`.
    pub start_from_plan_n: usize,
    /// Elements before this plan index get mask 0 regardless of their
    /// native preference (pure context, never trained on).
    pub mask_from_plan_n: usize,
    /// Token budget for required context.
    pub limit_ctx_n: usize,
    /// Token budget for optional (point-of-interest) context.
    pub limit_aux_n: usize,
    /// Append the end-of-text token.
    pub add_eot: bool,
    /// Training mode: stochastic range growth, byte budgets not enforced.
    pub for_training: bool,
}

impl Default for PackParams {
    fn default() -> Self {
        Self {
            start_from_plan_n: 0,
            mask_from_plan_n: 0,
            limit_ctx_n: crate::DEFAULT_LIMIT_CTX_N,
            limit_aux_n: crate::DEFAULT_LIMIT_AUX_N,
            add_eot: true,
            for_training: false,
        }
    }
}

/// Request-scoped budget accountant, exposed on the packer after each
/// `pack_context` call.
#[derive(Debug, Clone, Default)]
pub struct PackingContext {
    pub limit_ctx_n: usize,
    pub limit_aux_n: usize,
    pub filled_ctx_n: usize,
    pub filled_aux_n: usize,
    pub for_training: bool,
    /// Set when even the mandatory minimum exceeds the combined budget;
    /// packing still proceeds best-effort, required regions are never
    /// silently dropped.
    pub minimal_context_too_big_warning: bool,
    pub(crate) line_number_each: usize,
}

/// Orders elements into a plan and serializes it.
pub struct Packer<'f, E: Encoding> {
    fmt: &'f Format<E>,
    pub plan: Plan,
    pub tokens: Vec<Token>,
    pub mask: Vec<u8>,
    pub cx: PackingContext,
}

impl<'f, E: Encoding> Packer<'f, E> {
    pub fn new(fmt: &'f Format<E>) -> Self {
        Self::with_plan(fmt, Plan::new())
    }

    pub fn with_plan(fmt: &'f Format<E>, plan: Plan) -> Self {
        Self {
            fmt,
            plan,
            tokens: Vec::new(),
            mask: Vec::new(),
            cx: PackingContext::default(),
        }
    }

    /// Append an element, returning its plan index.
    pub fn add_to_plan(&mut self, el: Element) -> usize {
        self.plan.push(el)
    }

    pub fn add_file(&mut self, file: FileElement) -> FileId {
        self.plan.add_file(file)
    }

    /// Render `plan[params.start_from_plan_n..]` into `tokens` and `mask`.
    ///
    /// Elements are never split: either a whole element is emitted or the
    /// warning flag is raised. The call is repeatable with different
    /// budgets; each call resets the output buffers and re-records every
    /// element's `located_at` (its token offset within the packed array).
    pub fn pack_context(
        &mut self,
        params: &PackParams,
        rng: &mut dyn RngCore,
    ) -> Result<(), ProtocolError> {
        let mut cx = PackingContext {
            limit_ctx_n: params.limit_ctx_n,
            limit_aux_n: params.limit_aux_n,
            for_training: params.for_training,
            line_number_each: self.fmt.line_number_each,
            ..PackingContext::default()
        };
        if params.add_eot {
            cx.filled_ctx_n += 1;
        }
        let n0 = params.start_from_plan_n.min(self.plan.items.len());
        let mut bodies: Vec<Option<(Vec<Token>, Vec<u8>)>> =
            (0..self.plan.items.len()).map(|_| None).collect();

        // mandatory pass: headers, message and chunk bodies, seed lines
        for i in n0..self.plan.items.len() {
            match &self.plan.items[i] {
                Element::File(id) => {
                    let id = *id;
                    let header = self.plan.files[id.0].pack_init(self.fmt, &mut cx, rng);
                    bodies[i] = Some(header);
                }
                Element::Msg(msg) => {
                    let body = msg.pack_init(self.fmt)?;
                    cx.filled_ctx_n += body.0.len();
                    bodies[i] = Some(body);
                }
                Element::Chunk(ch) => {
                    let Some(fid) = ch.file else {
                        return Err(ProtocolError::UnresolvedChunk);
                    };
                    let filename = self.plan.files[fid.0].filename.clone();
                    let body = ch.pack_init(self.fmt, &filename)?;
                    cx.filled_ctx_n += body.0.len();
                    bodies[i] = Some(body);
                }
            }
        }
        if cx.filled_ctx_n + cx.filled_aux_n > cx.limit_ctx_n + cx.limit_aux_n {
            cx.minimal_context_too_big_warning = true;
        }

        // inflation: round-robin over files and ranges in plan order, one
        // line per direction per round, required ranges first
        for optional_pass in [false, true] {
            loop {
                let mut any = false;
                for i in n0..self.plan.items.len() {
                    if let Element::File(id) = &self.plan.items[i] {
                        let id = *id;
                        any |= self.plan.files[id.0].pack_inflate(self.fmt, &mut cx, optional_pass);
                    }
                }
                if !any {
                    break;
                }
            }
        }

        // render
        self.tokens.clear();
        self.mask.clear();
        for i in n0..self.plan.items.len() {
            let masked = i >= params.mask_from_plan_n;
            let at = self.tokens.len();
            match &mut self.plan.items[i] {
                Element::File(id) => {
                    let id = *id;
                    self.plan.files[id.0].located_at = Some(at);
                    let (ht, hm) = bodies[i].take().unwrap_or_default();
                    append(&mut self.tokens, &mut self.mask, ht, hm, masked);
                    let (bt, bm) = self.plan.files[id.0].pack_finish(self.fmt);
                    append(&mut self.tokens, &mut self.mask, bt, bm, masked);
                }
                Element::Msg(msg) => {
                    msg.located_at = Some(at);
                    let (t, m) = bodies[i].take().unwrap_or_default();
                    append(&mut self.tokens, &mut self.mask, t, m, masked);
                }
                Element::Chunk(ch) => {
                    ch.located_at = Some(at);
                    let (t, m) = bodies[i].take().unwrap_or_default();
                    append(&mut self.tokens, &mut self.mask, t, m, masked);
                }
            }
        }
        if params.add_eot {
            self.tokens.push(self.fmt.eot());
            let bit = if self.plan.items.len() > params.mask_from_plan_n {
                1
            } else {
                0
            };
            self.mask.push(bit);
        }
        self.cx = cx;
        Ok(())
    }

    /// Decoded text of the packed stream, for debugging.
    pub fn dump(&self) -> String {
        self.fmt.enc().decode(&self.tokens)
    }
}

fn append(tokens: &mut Vec<Token>, mask: &mut Vec<u8>, t: Vec<Token>, m: Vec<u8>, masked: bool) {
    tokens.extend(t);
    if masked {
        mask.extend(m);
    } else {
        mask.extend(std::iter::repeat(0u8).take(m.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgElement;
    use crate::testenc::TestEncoding;
    use crate::unpacker::Unpacker;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn msg_plan_packer(fmt: &Format<TestEncoding>) -> Packer<'_, TestEncoding> {
        let mut pack = Packer::new(fmt);
        pack.add_to_plan(Element::Msg(MsgElement::system("You are a coding assistant.")));
        pack.add_to_plan(Element::Msg(MsgElement::user("how are you?")));
        pack.add_to_plan(Element::Msg(MsgElement::assistant(
            "I'm not sure, I think I have bugs.",
        )));
        pack
    }

    #[test]
    fn test_messages_round_trip() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let mut pack = msg_plan_packer(&fmt);
        let params = PackParams {
            limit_ctx_n: 200,
            limit_aux_n: 0,
            ..PackParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        pack.pack_context(&params, &mut rng).unwrap();
        assert_eq!(pack.cx.filled_ctx_n, pack.tokens.len());
        assert_eq!(pack.cx.filled_aux_n, 0);
        assert!(!pack.cx.minimal_context_too_big_warning);
        assert_eq!(pack.tokens.len(), pack.mask.len());

        let mut u1 = Unpacker::new(&fmt, Plan::new(), 0);
        u1.feed_tokens(&pack.tokens).unwrap();
        let mut u2 = Unpacker::new(&fmt, Plan::new(), 0);
        for &t in &pack.tokens {
            u2.feed_tokens(&[t]).unwrap();
        }
        assert_eq!(u1.result.items.len(), 3);
        for i in 0..3 {
            assert_eq!(u1.result.describe(i), pack.plan.describe(i));
            assert_eq!(u2.result.describe(i), pack.plan.describe(i));
        }
    }

    #[test]
    fn test_mask_is_forced_zero_before_mask_from_plan_n() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let mut pack = msg_plan_packer(&fmt);
        let params = PackParams {
            mask_from_plan_n: 2,
            limit_ctx_n: 200,
            limit_aux_n: 0,
            ..PackParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        pack.pack_context(&params, &mut rng).unwrap();
        let third_at = pack.plan.located_at(2).unwrap();
        assert!(pack.mask[..third_at].iter().all(|&b| b == 0));
        assert!(pack.mask[third_at..].iter().all(|&b| b == 1));
    }

    #[test]
    fn test_located_at_points_at_each_signature() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let mut pack = msg_plan_packer(&fmt);
        let mut rng = StdRng::seed_from_u64(0);
        pack.pack_context(&PackParams::default(), &mut rng).unwrap();
        for i in 0..3 {
            let at = pack.plan.located_at(i).unwrap();
            assert_eq!(pack.tokens[at], fmt.escape());
        }
        assert_eq!(pack.plan.located_at(0), Some(0));
    }

    #[test]
    fn test_oversized_message_flags_instead_of_truncating() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let mut pack = Packer::new(&fmt);
        pack.add_to_plan(Element::Msg(MsgElement::user(
            "a very long instruction that cannot possibly fit",
        )));
        let params = PackParams {
            limit_ctx_n: 10,
            limit_aux_n: 0,
            ..PackParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        pack.pack_context(&params, &mut rng).unwrap();
        assert!(pack.cx.minimal_context_too_big_warning);
        // emitted whole regardless
        assert!(pack.dump().contains("a very long instruction"));
    }

    #[test]
    fn test_repacking_with_new_budgets_resets_output() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let mut pack = msg_plan_packer(&fmt);
        let mut rng = StdRng::seed_from_u64(0);
        pack.pack_context(&PackParams::default(), &mut rng).unwrap();
        let first = pack.tokens.clone();
        pack.pack_context(&PackParams::default(), &mut rng).unwrap();
        assert_eq!(first, pack.tokens);
    }
}
