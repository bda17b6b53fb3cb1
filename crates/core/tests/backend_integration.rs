//! End-to-end tests for the batched attention backend.
//!
//! Drive the public API the way a model runner does: prefill through extend,
//! step through decode, and replay captured decode plans, all on the CPU with
//! the reference kernels.

use std::sync::Arc;

use batch_attn_core::attention::{ExtendMetadata, MetadataBuilder};
use batch_attn_core::kv_cache::KvPoolConfig;
use batch_attn_core::{
    capture::pad_seq_lens, AttentionConfig, AttentionError, AttentionLayer,
    BatchedAttentionBackend, CaptureConfig, ForwardBatch, ForwardMode, NaiveKernels,
    ReqToTokenPool, TokenToKvPool,
};
use candle_core::{DType, Device, Tensor};

// ─── Helpers ─────────────────────────────────────────────────────────────────

const HEADS: usize = 4;
const KV_HEADS: usize = 2;
const HEAD_DIM: usize = 8;
const CONTEXT_LEN: usize = 16;
/// Routing row reserved for padded requests; maps every position to slot 0.
const PAD_REQ: usize = 7;

fn config() -> AttentionConfig {
    AttentionConfig {
        num_attention_heads: HEADS,
        tp_size: 1,
        context_len: CONTEXT_LEN,
        reduce_in_fp32: true,
        enable_dp_attention: false,
        capture: CaptureConfig {
            enabled: true,
            capture_sizes: vec![1, 2, 4],
            max_capture_size: 4,
        },
    }
}

fn backend() -> BatchedAttentionBackend {
    BatchedAttentionBackend::new(&config(), Device::Cpu, Arc::new(NaiveKernels::new())).unwrap()
}

fn layer() -> AttentionLayer {
    AttentionLayer::new(0, HEADS, KV_HEADS, HEAD_DIM)
}

struct Cache {
    pool: TokenToKvPool,
    req_to_token: ReqToTokenPool,
    /// Slot 0 is a dummy target for padded rows.
    next_slot: usize,
}

impl Cache {
    fn new() -> Self {
        let pool = TokenToKvPool::new(&KvPoolConfig {
            size: 64,
            num_layers: 1,
            num_kv_heads: KV_HEADS,
            qk_head_dim: HEAD_DIM,
            v_head_dim: HEAD_DIM,
            dtype: DType::F32,
            device: Device::Cpu,
        })
        .unwrap();
        let req_to_token = ReqToTokenPool::new(8, CONTEXT_LEN, &Device::Cpu).unwrap();
        Self {
            pool,
            req_to_token,
            next_slot: 1,
        }
    }

    fn append(&mut self, req_idx: usize, start: usize, n: usize) -> Vec<usize> {
        let slots: Vec<usize> = (self.next_slot..self.next_slot + n).collect();
        self.req_to_token.write(req_idx, start, &slots).unwrap();
        self.next_slot += n;
        slots
    }
}

/// Per-request token projections: q `[len, HEADS*HEAD_DIM]`, k/v `[len, KV_HEADS*HEAD_DIM]`.
struct Tokens {
    q: Tensor,
    k: Tensor,
    v: Tensor,
}

impl Tokens {
    fn random(len: usize) -> Self {
        let device = Device::Cpu;
        Self {
            q: Tensor::randn(0f32, 1f32, (len, HEADS * HEAD_DIM), &device).unwrap(),
            k: Tensor::randn(0f32, 1f32, (len, KV_HEADS * HEAD_DIM), &device).unwrap(),
            v: Tensor::randn(0f32, 1f32, (len, KV_HEADS * HEAD_DIM), &device).unwrap(),
        }
    }
}

/// Concatenate rows `range` of each request's tokens, in request order.
fn gather(requests: &[&Tokens], ranges: &[(usize, usize)]) -> (Tensor, Tensor, Tensor) {
    let pick = |f: fn(&Tokens) -> &Tensor| {
        let parts: Vec<Tensor> = requests
            .iter()
            .zip(ranges)
            .map(|(&t, &(start, len))| f(t).narrow(0, start, len).unwrap())
            .collect();
        Tensor::cat(&parts, 0).unwrap()
    };
    (pick(|t| &t.q), pick(|t| &t.k), pick(|t| &t.v))
}

fn run(
    backend: &BatchedAttentionBackend,
    cache: &mut Cache,
    batch: &ForwardBatch,
    (q, k, v): &(Tensor, Tensor, Tensor),
) -> Tensor {
    backend
        .forward(
            q,
            k,
            v,
            &layer(),
            batch,
            &mut cache.pool,
            &cache.req_to_token,
        )
        .unwrap()
}

fn assert_rows_close(a: &Tensor, b: &Tensor) {
    let a: Vec<Vec<f32>> = a.to_vec2().unwrap();
    let b: Vec<Vec<f32>> = b.to_vec2().unwrap();
    assert_eq!(a.len(), b.len());
    for (ra, rb) in a.iter().zip(&b) {
        for (x, y) in ra.iter().zip(rb) {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }
}

/// Prefill `prompt_lens` tokens per request through extend.
fn prefill(
    backend: &mut BatchedAttentionBackend,
    cache: &mut Cache,
    reqs: &[usize],
    tokens: &[&Tokens],
    prompt_lens: &[usize],
) {
    let out_cache_loc: Vec<usize> = reqs
        .iter()
        .zip(prompt_lens)
        .flat_map(|(&r, &n)| cache.append(r, 0, n))
        .collect();
    let batch = ForwardBatch::extend(
        reqs.to_vec(),
        prompt_lens.to_vec(),
        vec![0; reqs.len()],
        out_cache_loc,
    )
    .unwrap();
    backend.init_forward_metadata(&batch).unwrap();
    let ranges: Vec<(usize, usize)> = prompt_lens.iter().map(|&n| (0, n)).collect();
    run(backend, cache, &batch, &gather(tokens, &ranges));
}

/// Decode one token per request at position `prompt_lens[i]` with fresh metadata.
fn decode_step(
    backend: &mut BatchedAttentionBackend,
    cache: &mut Cache,
    reqs: &[usize],
    tokens: &[&Tokens],
    prompt_lens: &[usize],
) -> Tensor {
    let out_cache_loc: Vec<usize> = reqs
        .iter()
        .zip(prompt_lens)
        .flat_map(|(&r, &n)| cache.append(r, n, 1))
        .collect();
    let seq_lens: Vec<usize> = prompt_lens.iter().map(|&n| n + 1).collect();
    let batch = ForwardBatch::decode(reqs.to_vec(), seq_lens, out_cache_loc).unwrap();
    backend.init_forward_metadata(&batch).unwrap();
    let ranges: Vec<(usize, usize)> = prompt_lens.iter().map(|&n| (n, 1)).collect();
    run(backend, cache, &batch, &gather(tokens, &ranges))
}

// ─── Metadata scenarios ──────────────────────────────────────────────────────

#[test]
fn test_decode_metadata_scenario() {
    let backend = backend();
    let batch = ForwardBatch::decode(vec![0, 1, 2], vec![4, 1, 7], vec![0, 1, 2]).unwrap();
    let metadata = backend.build_metadata(&batch).unwrap();
    assert_eq!(metadata.mode(), ForwardMode::Decode);

    let decode = metadata.as_decode().unwrap();
    assert_eq!(decode.start_loc.to_vec1::<u32>().unwrap(), vec![0, 4, 5]);
    assert_eq!(decode.total_tokens(), 12);
    assert_eq!(decode.attn_logits.dims(), &[HEADS, 12]);
    assert_eq!(decode.attn_logits.dtype(), DType::F32);
    assert_eq!(decode.max_seq_len, 7);
}

#[test]
fn test_extend_metadata_scenario() {
    let builder = MetadataBuilder::new(HEADS, DType::F32, Device::Cpu);
    let metadata = builder
        .build(ForwardMode::Extend, &[10, 6], Some(&[8, 6]))
        .unwrap();
    assert_eq!(
        *metadata.as_extend().unwrap(),
        ExtendMetadata { max_extend_len: 2 }
    );
}

#[test]
fn test_sub_batch_metadata_uses_selected_requests() {
    let backend = backend();
    let batch = ForwardBatch::decode(vec![0, 1, 2, 3], vec![3, 5, 2, 9], vec![0, 1])
        .unwrap()
        .with_local_seq_indices(vec![0, 2])
        .unwrap();
    let metadata = backend.build_metadata(&batch).unwrap();
    let decode = metadata.as_decode().unwrap();
    assert_eq!(decode.start_loc.to_vec1::<u32>().unwrap(), vec![0, 3]);
    assert_eq!(decode.max_seq_len, 3);
    assert_eq!(decode.total_tokens(), 5);
}

#[test]
fn test_build_metadata_idempotent() {
    let backend = backend();
    let batch = ForwardBatch::decode(vec![0, 1], vec![6, 2], vec![0, 1]).unwrap();
    let first = backend.build_metadata(&batch).unwrap();
    let second = backend.build_metadata(&batch).unwrap();
    let (a, b) = (first.as_decode().unwrap(), second.as_decode().unwrap());
    assert_eq!(
        a.start_loc.to_vec1::<u32>().unwrap(),
        b.start_loc.to_vec1::<u32>().unwrap()
    );
    assert_eq!(a.attn_logits.dims(), b.attn_logits.dims());
    assert_eq!(a.max_seq_len, b.max_seq_len);
}

// ─── Mode consistency ────────────────────────────────────────────────────────

#[test]
fn test_decode_matches_single_extend() {
    let t0 = Tokens::random(6);
    let t1 = Tokens::random(4);
    let reqs = [0, 1];

    // Prefill 5 + 3 tokens, then decode one more token each
    let mut stepped = backend();
    let mut stepped_cache = Cache::new();
    prefill(&mut stepped, &mut stepped_cache, &reqs, &[&t0, &t1], &[5, 3]);
    let decoded = decode_step(&mut stepped, &mut stepped_cache, &reqs, &[&t0, &t1], &[5, 3]);
    assert_eq!(decoded.dims(), &[2, HEADS * HEAD_DIM]);

    // The whole sequence in one extend; last row of each request must agree
    let mut whole = backend();
    let mut whole_cache = Cache::new();
    let out_cache_loc: Vec<usize> = whole_cache
        .append(0, 0, 6)
        .into_iter()
        .chain(whole_cache.append(1, 0, 4))
        .collect();
    let batch = ForwardBatch::extend(reqs.to_vec(), vec![6, 4], vec![0, 0], out_cache_loc).unwrap();
    whole.init_forward_metadata(&batch).unwrap();
    let full = run(
        &whole,
        &mut whole_cache,
        &batch,
        &gather(&[&t0, &t1], &[(0, 6), (0, 4)]),
    );
    assert_eq!(full.dims(), &[10, HEADS * HEAD_DIM]);

    let last_rows = Tensor::cat(
        &[full.narrow(0, 5, 1).unwrap(), full.narrow(0, 9, 1).unwrap()],
        0,
    )
    .unwrap();
    assert_rows_close(&decoded, &last_rows);
}

#[test]
fn test_extend_over_cached_prefix_matches_decode() {
    let t0 = Tokens::random(4);
    let reqs = [0];

    let mut via_decode = backend();
    let mut decode_cache = Cache::new();
    prefill(&mut via_decode, &mut decode_cache, &reqs, &[&t0], &[3]);
    let decoded = decode_step(&mut via_decode, &mut decode_cache, &reqs, &[&t0], &[3]);

    let mut via_extend = backend();
    let mut extend_cache = Cache::new();
    prefill(&mut via_extend, &mut extend_cache, &reqs, &[&t0], &[3]);
    let out_cache_loc = extend_cache.append(0, 3, 1);
    let batch = ForwardBatch::extend(vec![0], vec![4], vec![3], out_cache_loc).unwrap();
    via_extend.init_forward_metadata(&batch).unwrap();
    let extended = run(
        &via_extend,
        &mut extend_cache,
        &batch,
        &gather(&[&t0], &[(3, 1)]),
    );

    assert_rows_close(&decoded, &extended);
}

// ─── Capture / replay ────────────────────────────────────────────────────────

#[test]
fn test_replayed_decode_matches_fresh_decode() {
    let t0 = Tokens::random(6);
    let t1 = Tokens::random(3);
    let t2 = Tokens::random(5);
    let tokens = [&t0, &t1, &t2];
    let reqs = [0, 1, 2];
    let prompt_lens = [5, 2, 4];

    let mut fresh = backend();
    let mut fresh_cache = Cache::new();
    prefill(&mut fresh, &mut fresh_cache, &reqs, &tokens, &prompt_lens);
    let expected = decode_step(&mut fresh, &mut fresh_cache, &reqs, &tokens, &prompt_lens);

    let mut replayed = backend();
    let mut cache = Cache::new();
    let max_bs = replayed.config().capture.max_batch_size();
    replayed.init_capture_state(max_bs).unwrap();
    for bs in replayed.config().capture.warmup_sizes() {
        let fill = vec![replayed.padding_fill_value(); bs];
        replayed
            .init_forward_metadata_capture(bs, &vec![PAD_REQ; bs], &fill)
            .unwrap();
    }
    assert_eq!(
        replayed.capture_state().unwrap().captured_sizes(),
        vec![1, 2, 4]
    );

    prefill(&mut replayed, &mut cache, &reqs, &tokens, &prompt_lens);

    // Three live requests padded up to the captured size of 4
    let padded_bs = replayed.capture_batch_size(reqs.len()).unwrap();
    assert_eq!(padded_bs, 4);
    let mut out_cache_loc: Vec<usize> = reqs
        .iter()
        .zip(&prompt_lens)
        .flat_map(|(&r, &n)| cache.append(r, n, 1))
        .collect();
    out_cache_loc.resize(padded_bs, 0);
    let live_seq_lens: Vec<usize> = prompt_lens.iter().map(|&n| n + 1).collect();
    let seq_lens = pad_seq_lens(&live_seq_lens, padded_bs);
    assert_eq!(seq_lens, vec![6, 3, 5, 1]);
    let mut req_pool_indices = reqs.to_vec();
    req_pool_indices.resize(padded_bs, PAD_REQ);

    replayed
        .init_forward_metadata_replay(padded_bs, &seq_lens)
        .unwrap();
    let start_loc: Vec<u32> = replayed
        .forward_metadata()
        .unwrap()
        .as_decode()
        .unwrap()
        .start_loc
        .to_vec1()
        .unwrap();
    assert_eq!(start_loc, vec![0, 6, 9, 14]);

    let batch = ForwardBatch::decode(req_pool_indices, seq_lens, out_cache_loc).unwrap();
    let (q, k, v) = gather(&tokens, &[(5, 1), (2, 1), (4, 1)]);
    let pad_q = Tensor::zeros((1, HEADS * HEAD_DIM), DType::F32, &Device::Cpu).unwrap();
    let pad_kv = Tensor::zeros((1, KV_HEADS * HEAD_DIM), DType::F32, &Device::Cpu).unwrap();
    let inputs = (
        Tensor::cat(&[&q, &pad_q], 0).unwrap(),
        Tensor::cat(&[&k, &pad_kv], 0).unwrap(),
        Tensor::cat(&[&v, &pad_kv], 0).unwrap(),
    );
    let out = run(&replayed, &mut cache, &batch, &inputs);
    assert_eq!(out.dims(), &[4, HEADS * HEAD_DIM]);

    assert_rows_close(&out.narrow(0, 0, 3).unwrap(), &expected);
}

#[test]
fn test_replay_over_capacity_fails_fast() {
    let mut backend = backend();
    backend.init_capture_state(4).unwrap();
    backend.init_forward_metadata_replay(3, &[2, 2, 2]).unwrap();
    let before: Vec<u32> = backend
        .capture_state()
        .unwrap()
        .start_loc()
        .to_vec1()
        .unwrap();

    let err = backend
        .init_forward_metadata_replay(5, &[1; 5])
        .unwrap_err();
    assert!(matches!(
        err,
        AttentionError::CapacityOverflow {
            requested: 5,
            capacity: 4,
            ..
        }
    ));
    let err = backend
        .init_forward_metadata_replay(2, &[1, CONTEXT_LEN + 1])
        .unwrap_err();
    assert!(matches!(err, AttentionError::CapacityOverflow { .. }));

    let after: Vec<u32> = backend
        .capture_state()
        .unwrap()
        .start_loc()
        .to_vec1()
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(after, vec![0, 2, 4, 0]);
}

#[test]
fn test_capture_buffers_never_reallocated() {
    let mut backend = backend();
    backend.init_capture_state(4).unwrap();
    let logits_dims = backend
        .capture_state()
        .unwrap()
        .attn_logits()
        .dims()
        .to_vec();
    assert_eq!(logits_dims, vec![HEADS, 4 * CONTEXT_LEN]);

    backend.init_forward_metadata_capture(4, &[0; 4], &[1; 4]).unwrap();
    let captured = backend
        .forward_metadata()
        .unwrap()
        .as_decode()
        .unwrap()
        .clone();
    assert_eq!(captured.max_seq_len, CONTEXT_LEN);

    for lens in [[3, 1, 4, 1], [9, 2, 6, 5], [1, 1, 1, 1]] {
        backend.init_forward_metadata_replay(4, &lens).unwrap();
        // The captured views observe every replay in place
        let expected = batch_attn_core::attention::exclusive_cumsum(&lens).unwrap();
        assert_eq!(captured.start_loc.to_vec1::<u32>().unwrap(), expected);
        assert_eq!(
            backend.capture_state().unwrap().attn_logits().dims(),
            logits_dims.as_slice()
        );
    }
}

// ─── Edge cases ──────────────────────────────────────────────────────────────

#[test]
fn test_empty_batches_are_no_ops() {
    let mut backend = backend();
    let mut cache = Cache::new();
    let empty_q = Tensor::zeros((0, HEADS * HEAD_DIM), DType::F32, &Device::Cpu).unwrap();
    let empty_kv = Tensor::zeros((0, KV_HEADS * HEAD_DIM), DType::F32, &Device::Cpu).unwrap();
    let inputs = (empty_q, empty_kv.clone(), empty_kv);

    let decode = ForwardBatch::decode(vec![], vec![], vec![]).unwrap();
    let metadata = backend.build_metadata(&decode).unwrap();
    let m = metadata.as_decode().unwrap();
    assert_eq!(m.max_seq_len, 0);
    assert_eq!(m.start_loc.dims(), &[0]);
    assert_eq!(m.attn_logits.dims(), &[HEADS, 0]);
    backend.init_forward_metadata(&decode).unwrap();
    assert_eq!(run(&backend, &mut cache, &decode, &inputs).dims(), &[0, HEADS * HEAD_DIM]);

    let extend = ForwardBatch::extend(vec![], vec![], vec![], vec![]).unwrap();
    backend.init_forward_metadata(&extend).unwrap();
    assert_eq!(run(&backend, &mut cache, &extend, &inputs).dims(), &[0, HEADS * HEAD_DIM]);
}

#[test]
fn test_backend_from_toml() {
    let config = AttentionConfig::from_toml_str(
        r#"
        num_attention_heads = 8
        tp_size = 2
        context_len = 64
        reduce_in_fp32 = true

        [capture]
        enabled = true
        capture_sizes = [1, 2]
        "#,
    )
    .unwrap();
    let mut backend =
        BatchedAttentionBackend::new(&config, Device::Cpu, Arc::new(NaiveKernels::new())).unwrap();
    assert_eq!(backend.num_heads(), 4);
    assert_eq!(backend.kernels_name(), "naive");

    backend
        .init_capture_state(config.capture.max_batch_size())
        .unwrap();
    let state = backend.capture_state().unwrap();
    assert_eq!(state.max_batch_size(), 2);
    assert_eq!(state.attn_logits().dims(), &[4, 2 * 64]);
}
