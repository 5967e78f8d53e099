use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sealvault::{generate_master_key, CipherMode, Vault};

fn benchmark_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("aes256");
    let vault = Vault::new(generate_master_key().unwrap());
    let key = vault.import(&[0x42; 32]).unwrap();

    let input = vec![0u8; 16 * 1024];
    let mut output = vec![0u8; input.len()];
    group.throughput(Throughput::Bytes(input.len() as u64));

    for mode in [
        CipherMode::Ecb,
        CipherMode::Cbc,
        CipherMode::Ofb,
        CipherMode::Cfb8,
        CipherMode::Cfb128,
        CipherMode::Ctr,
    ] {
        let aes = vault.aes(mode, key).unwrap();
        let iv = vec![0u8; aes.iv_len()];
        group.bench_function(BenchmarkId::from_parameter(mode), |b| {
            b.iter(|| aes.encrypt(&iv, black_box(&input), &mut output).unwrap());
        });
    }
    group.finish();

    // Bit-wise feedback is far slower; measure it on a smaller input.
    let mut group = c.benchmark_group("aes256_cfb1");
    let aes = vault.aes(CipherMode::Cfb1, key).unwrap();
    let small = vec![0u8; 256];
    let mut out = vec![0u8; small.len()];
    group.throughput(Throughput::Bytes(small.len() as u64));
    group.bench_function("256B", |b| {
        b.iter(|| aes.encrypt(&[0u8; 16], black_box(&small), &mut out).unwrap());
    });
    group.finish();
}

criterion_group!(benches, benchmark_modes);
criterion_main!(benches);
