use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mosaic_nas::prelude::*;
use mosaic_nas::search::{Sgd, SgdConfig};

fn search_desc(channels: usize) -> ModelDesc {
    let ch = ConvMacroParams::new(channels, channels);
    let mut cell = CellDesc::new(false, channels, channels);
    cell.add_node(vec![EdgeDesc::new(
        0,
        &["identity", "none", "sep_conv_3x3", "max_pool_3x3"],
        ch,
        1,
    )]);
    cell.add_node(vec![
        EdgeDesc::new(0, &["skip_connect", "sep_conv_3x3"], ch, 1),
        EdgeDesc::new(1, &["sep_conv_3x3", "dil_conv_3x3", "none"], ch, 1),
    ]);
    ModelDesc::new(
        channels,
        10,
        OpDesc::new("stem", ConvMacroParams::new(channels, channels), 1),
        vec![cell],
        OpDesc::new("pool_linear", ConvMacroParams::new(channels, 10), 1),
    )
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("supernet_forward");
    let catalog = OpCatalog::with_defaults();

    for channels in [4, 8].iter() {
        let model = Supernet::new(&search_desc(*channels), &catalog, 0).unwrap();
        let x = Tensor::from_elem((8, *channels, 16, 16), 0.1);

        group.bench_with_input(
            BenchmarkId::new("forward", channels),
            &model,
            |b, model| b.iter(|| model.forward(black_box(&x))),
        );
    }

    group.finish();
}

fn bench_train_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("supernet_train_step");
    group.sample_size(10);
    let catalog = OpCatalog::with_defaults();
    let loss = CrossEntropy::new();

    for channels in [4, 8].iter() {
        let mut model = Supernet::new(&search_desc(*channels), &catalog, 0).unwrap();
        let mut sgd = Sgd::new(SgdConfig::default());
        let x = Tensor::from_elem((8, *channels, 16, 16), 0.1);
        let y: Vec<usize> = (0..8).map(|i| i % 10).collect();

        group.bench_with_input(BenchmarkId::new("step", channels), &(), |b, _| {
            b.iter(|| {
                model.zero_grads();
                model.backward_pass(black_box(&x), &y, &loss, None);
                sgd.step(&mut model);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_forward, bench_train_step);
criterion_main!(benches);
