use aas_trainer_rs::ctc::{ctc_loss, BLANK};
use candle_core::{Device, Tensor, Var};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const VOCAB: usize = 29;

fn logits(frames: usize, batch: usize) -> Tensor {
    let values: Vec<f32> = (0..frames * batch * VOCAB)
        .map(|i| (i as f32 * 0.013).sin())
        .collect();
    Tensor::from_vec(values, (frames, batch, VOCAB), &Device::Cpu).unwrap()
}

/// Targets of `len` labels per utterance, cycling through the alphabet.
fn targets(batch: usize, len: usize) -> (Vec<u32>, Vec<usize>) {
    let labels = (0..batch * len).map(|i| 1 + (i % (VOCAB - 1)) as u32).collect();
    (labels, vec![len; batch])
}

fn bench_ctc_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("ctc_forward");

    for frames in [50, 100, 200] {
        let batch = 4;
        let xs = logits(frames, batch);
        let (labels, lengths) = targets(batch, frames / 5);
        let input_lengths = vec![frames; batch];

        group.bench_with_input(BenchmarkId::from_parameter(frames), &frames, |b, _| {
            b.iter(|| {
                let loss =
                    ctc_loss(black_box(&xs), &labels, &input_lengths, &lengths, BLANK).unwrap();
                black_box(loss);
            });
        });
    }

    group.finish();
}

fn bench_ctc_backward(c: &mut Criterion) {
    let frames = 100;
    let batch = 4;
    let xs = Var::from_tensor(&logits(frames, batch)).unwrap();
    let (labels, lengths) = targets(batch, 20);
    let input_lengths = vec![frames; batch];

    c.bench_function("ctc_backward_100", |b| {
        b.iter(|| {
            let loss = ctc_loss(xs.as_tensor(), &labels, &input_lengths, &lengths, BLANK).unwrap();
            black_box(loss.backward().unwrap());
        });
    });
}

criterion_group!(benches, bench_ctc_forward, bench_ctc_backward);
criterion_main!(benches);
