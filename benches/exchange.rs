use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures_util::future::join_all;
use groupcomm::{ExchangeOrder, GroupDescriptor, Network, NetworkConfig, RetryPolicy};
use rand::RngCore;
use tokio::runtime::Runtime;

fn connect_group(rt: &Runtime, n: usize, base_port: u16) -> Vec<Network> {
    let config = NetworkConfig::default()
        .with_base_port(base_port)
        .with_retry(RetryPolicy {
            backoff: Duration::from_millis(5),
            max_attempts: Some(2000),
        });

    let mut nets: Vec<Network> = (0..n)
        .map(|id| Network::new(GroupDescriptor::localhost(id, n).unwrap(), config.clone()).unwrap())
        .collect();
    rt.block_on(async {
        for result in join_all(nets.iter_mut().map(|net| net.connect())).await {
            result.unwrap();
        }
    });
    nets
}

fn bench_loopback(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let nets = connect_group(&rt, 1, 26000);
    let net = &nets[0];
    let mut group = c.benchmark_group("loopback");

    for size in [1 << 10, 1 << 16, 1 << 20] {
        let mut buf = vec![0u8; size];
        rand::rng().fill_bytes(&mut buf);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &buf, |b, buf| {
            b.iter(|| {
                rt.block_on(async {
                    net.send_to(0, buf).await.unwrap();
                    net.recv_from(0, buf.len()).await.unwrap()
                })
            })
        });
    }
    group.finish();
}

fn bench_ring(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("ring");

    for (i, n) in [2usize, 3, 4].into_iter().enumerate() {
        let nets = connect_group(&rt, n, 26100 + 100 * i as u16);
        let size = 1 << 16;

        group.throughput(Throughput::Bytes((size * n) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &nets, |b, nets| {
            b.iter(|| {
                rt.block_on(join_all(nets.iter().map(|net| async move {
                    let sbuf = vec![net.local_id() as u8; size];
                    net.exchange_ring(&sbuf, size, ExchangeOrder::Decreasing)
                        .await
                        .unwrap()
                })))
            })
        });
    }
    group.finish();
}

fn bench_exchange_all(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let n = 4;
    let nets = connect_group(&rt, n, 26500);
    let mut group = c.benchmark_group("exchange_all");

    for size in [1 << 10, 1 << 18] {
        group.throughput(Throughput::Bytes((size * n * n) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(join_all(nets.iter().map(|net| async move {
                    let sbufs = vec![vec![net.local_id() as u8; size]; n];
                    net.exchange_all(&sbufs, &vec![size; n]).await.unwrap()
                })))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_loopback, bench_ring, bench_exchange_all);
criterion_main!(benches);
