//! End-to-end relational scenarios: each test runs the full learning
//! protocol (random sample passes, then full passes), compresses, and
//! checks both the round trip and the size envelope.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rowpack::relation::{RelationCompressor, RelationDecompressor};
use rowpack::squid::EnumInterpreter;
use rowpack::{
    AttrType, AttrValue, CodingOptions, CompressionConfig, ModelRegistry, Schema, Tuple,
    NUM_EST_SAMPLE,
};

/// Drive the learning protocol the way the reference drivers do: every pass
/// starts with `NUM_EST_SAMPLE` random draws, then the data in order.
fn compress_all(
    tuples: &[Tuple],
    schema: &Schema,
    config: CompressionConfig,
    opts: CodingOptions,
    registry: Arc<ModelRegistry>,
) -> (Vec<u8>, u64) {
    let mut compressor =
        RelationCompressor::new(Vec::new(), schema.clone(), config, opts, registry);
    let mut rng = StdRng::seed_from_u64(0);
    while compressor.needs_more_learning() {
        for _ in 0..NUM_EST_SAMPLE {
            let pick = rng.gen_range(0..tuples.len());
            compressor.learn_tuple(&tuples[pick]);
        }
        for t in tuples {
            compressor.learn_tuple(t);
        }
        compressor.end_of_learning().unwrap();
    }
    let model_bits = compressor.model_size_bits();
    for t in tuples {
        compressor.compress_tuple(t).unwrap();
    }
    (compressor.finish().unwrap(), model_bits)
}

fn decompress_all(
    data: Vec<u8>,
    schema: &Schema,
    opts: CodingOptions,
    registry: Arc<ModelRegistry>,
) -> Vec<Tuple> {
    let mut dec = RelationDecompressor::new(data, schema.clone(), opts, registry).unwrap();
    let mut out = Vec::with_capacity(dec.total_tuples() as usize);
    let mut tuple = Tuple::new(schema.len());
    while dec.has_next() {
        dec.read_next_tuple(&mut tuple).unwrap();
        out.push(tuple.clone());
    }
    out
}

fn enum_registry(caps: &[(usize, usize)], cols: usize) -> Arc<ModelRegistry> {
    let mut registry = ModelRegistry::new(cols);
    for &(idx, cap) in caps {
        registry.set_interpreter(idx, Arc::new(EnumInterpreter::new(cap)));
    }
    Arc::new(registry)
}

#[test]
fn scenario_pure_categorical_pairs() {
    // The 9 pairs over enum[3] x enum[3], repeated 100 times.
    let schema = Schema::new(vec![AttrType::Categorical, AttrType::Categorical]);
    let mut tuples = Vec::new();
    for _ in 0..100 {
        for a in 0..3 {
            for b in 0..3 {
                let mut t = Tuple::new(2);
                t.values[0] = AttrValue::Int(a);
                t.values[1] = AttrValue::Int(b);
                tuples.push(t);
            }
        }
    }
    let registry = enum_registry(&[(0, 3), (1, 3)], 2);
    let config = CompressionConfig {
        allowed_err: vec![0.0, 0.0],
        skip_model_learning: false,
    };
    let opts = CodingOptions {
        delayed_bits: 24,
        block_size: 20_000,
    };
    let (data, model_bits) = compress_all(&tuples, &schema, config, opts, Arc::clone(&registry));

    // Uniform pairs carry log2(9) bits each; with the model and index the
    // whole file stays well under the 500 byte envelope.
    assert!(data.len() <= 500, "compressed {} bytes", data.len());
    assert!(data.len() as f64 >= 900.0 * 9f64.log2() / 8.0);
    assert!(model_bits / 8 < 200);

    let decoded = decompress_all(data, &schema, opts, registry);
    assert_eq!(decoded, tuples);
}

#[test]
fn scenario_skewed_integers() {
    // 9,000 copies of 42 plus 1,000 spread over [0, 1000].
    let schema = Schema::new(vec![AttrType::Integer]);
    let mut rng = StdRng::seed_from_u64(7);
    let mut tuples: Vec<Tuple> = (0..9000)
        .map(|_| {
            let mut t = Tuple::new(1);
            t.values[0] = AttrValue::Int(42);
            t
        })
        .collect();
    for _ in 0..1000 {
        let mut t = Tuple::new(1);
        t.values[0] = AttrValue::Int(rng.gen_range(0..=1000));
        tuples.push(t);
    }

    let registry = Arc::new(ModelRegistry::new(1));
    let config = CompressionConfig {
        allowed_err: vec![0.0],
        skip_model_learning: false,
    };
    let opts = CodingOptions {
        delayed_bits: 24,
        block_size: 20_000,
    };
    let (data, model_bits) = compress_all(&tuples, &schema, config, opts, Arc::clone(&registry));

    let data_bytes = data.len() as u64 - model_bits / 8;
    assert!(data_bytes <= 2000, "data region {} bytes", data_bytes);
    assert!(model_bits / 8 <= 1100, "model {} bytes", model_bits / 8);

    let decoded = decompress_all(data, &schema, opts, registry);
    assert_eq!(decoded, tuples);
}

#[test]
fn scenario_real_with_tolerance() {
    // sin(i/100) * 10 with allowed error 0.5, so bin size 1.0.
    let schema = Schema::new(vec![AttrType::Double]);
    let tuples: Vec<Tuple> = (0..10_000)
        .map(|i| {
            let mut t = Tuple::new(1);
            t.values[0] = AttrValue::Double((i as f64 / 100.0).sin() * 10.0);
            t
        })
        .collect();

    let registry = Arc::new(ModelRegistry::new(1));
    let config = CompressionConfig {
        allowed_err: vec![0.5],
        skip_model_learning: false,
    };
    let opts = CodingOptions {
        delayed_bits: 24,
        block_size: 20_000,
    };
    let (data, _) = compress_all(&tuples, &schema, config, opts, Arc::clone(&registry));

    // At least 5x against 8 bytes per raw value.
    assert!(
        data.len() <= 10_000 * 8 / 5,
        "compressed {} bytes",
        data.len()
    );

    let decoded = decompress_all(data, &schema, opts, registry);
    for (orig, dec) in tuples.iter().zip(&decoded) {
        let err = (orig.values[0].double() - dec.values[0].double()).abs();
        assert!(err <= 0.5, "error {err}");
    }
}

#[test]
fn scenario_string_dictionary() {
    // 1,000 rows over three fruit names, arranged without consecutive
    // repeats so the delta path stays quiet and the dictionary dominates.
    let schema = Schema::new(vec![AttrType::Str]);
    let mut counts = [500usize, 300, 200];
    let names = ["apple", "banana", "cherry"];
    let mut tuples = Vec::new();
    let mut last = usize::MAX;
    while counts.iter().sum::<usize>() > 0 {
        let pick = (0..3)
            .filter(|&i| counts[i] > 0 && i != last)
            .max_by_key(|&i| counts[i])
            .unwrap_or_else(|| (0..3).find(|&i| counts[i] > 0).unwrap());
        counts[pick] -= 1;
        last = pick;
        let mut t = Tuple::new(1);
        t.values[0] = AttrValue::Str(names[pick].to_string());
        tuples.push(t);
    }
    assert_eq!(tuples.len(), 1000);

    let registry = Arc::new(ModelRegistry::new(1));
    let config = CompressionConfig {
        allowed_err: vec![0.0],
        skip_model_learning: false,
    };
    let opts = CodingOptions {
        delayed_bits: 24,
        block_size: 20_000,
    };
    let (data, model_bits) = compress_all(&tuples, &schema, config, opts, Arc::clone(&registry));

    // Entropy of (0.5, 0.3, 0.2) is about 1.485 bits per row; the data
    // region must land within 20% of it (plus coding slack per block).
    let data_bytes = data.len() as f64 - (model_bits / 8) as f64;
    let entropy_bytes = 1000.0 * 1.4855 / 8.0;
    assert!(
        data_bytes <= entropy_bytes * 1.2 + 16.0,
        "data region {data_bytes} bytes vs entropy {entropy_bytes}"
    );

    let decoded = decompress_all(data, &schema, opts, registry);
    assert_eq!(decoded, tuples);
}

#[test]
fn scenario_random_access_agrees_with_scan() {
    // 100,000 tuples, one tuple per block, random probes against the scan.
    let schema = Schema::new(vec![AttrType::Categorical, AttrType::Integer]);
    let mut rng = StdRng::seed_from_u64(99);
    let tuples: Vec<Tuple> = (0..100_000)
        .map(|_| {
            let mut t = Tuple::new(2);
            t.values[0] = AttrValue::Int(rng.gen_range(0..6));
            t.values[1] = AttrValue::Int(rng.gen_range(0..500));
            t
        })
        .collect();

    let registry = enum_registry(&[(0, 6)], 2);
    let config = CompressionConfig {
        allowed_err: vec![0.0, 0.0],
        skip_model_learning: true,
    };
    let opts = CodingOptions {
        delayed_bits: 16,
        block_size: 1,
    };
    let (data, _) = compress_all(&tuples, &schema, config, opts, Arc::clone(&registry));

    let scanned = decompress_all(data.clone(), &schema, opts, Arc::clone(&registry));
    assert_eq!(scanned, tuples);

    let mut dec = RelationDecompressor::new(data, schema, opts, registry).unwrap();
    for _ in 0..1000 {
        let idx = rng.gen_range(0..100_000u32);
        let tuple = dec.read_tuple_at(idx).unwrap();
        assert_eq!(&tuple, &tuples[idx as usize], "tuple {idx}");
    }
}

#[test]
fn markov_column_roundtrips_sequentially() {
    let schema = Schema::new(vec![AttrType::CategoricalMarkov]);
    let mut tuples = Vec::new();
    // A sticky chain: long runs with occasional transitions.
    let mut state = 0i32;
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..20_000 {
        if rng.gen_range(0..10) == 0 {
            state = (state + 1) % 4;
        }
        let mut t = Tuple::new(1);
        t.values[0] = AttrValue::Int(state);
        tuples.push(t);
    }

    let registry = enum_registry(&[(0, 4)], 1);
    let config = CompressionConfig {
        allowed_err: vec![0.0],
        skip_model_learning: true,
    };
    let opts = CodingOptions {
        delayed_bits: 24,
        block_size: 20_000,
    };
    let (data, model_bits) = compress_all(&tuples, &schema, config, opts, Arc::clone(&registry));

    // The sticky chain compresses far below the unconditional entropy.
    let data_bytes = data.len() as u64 - model_bits / 8;
    assert!(data_bytes < 20_000 / 4, "data region {data_bytes} bytes");

    let decoded = decompress_all(data.clone(), &schema, opts, Arc::clone(&registry));
    assert_eq!(decoded, tuples);

    // Random access over a markov column is refused, not silently wrong.
    let mut dec = RelationDecompressor::new(data, schema, opts, registry).unwrap();
    assert!(dec.locate_tuple(100).is_err());
}

#[test]
fn file_roundtrip_through_disk() {
    let (schema, tuples) = {
        let schema = Schema::new(vec![AttrType::Categorical, AttrType::Integer]);
        let tuples: Vec<Tuple> = (0..2000)
            .map(|i| {
                let mut t = Tuple::new(2);
                t.values[0] = AttrValue::Int((i % 4) as i32);
                t.values[1] = AttrValue::Int((i * 3 % 777) as i32);
                t
            })
            .collect();
        (schema, tuples)
    };
    let registry = enum_registry(&[(0, 4)], 2);
    let config = CompressionConfig {
        allowed_err: vec![0.0, 0.0],
        skip_model_learning: true,
    };
    let opts = CodingOptions {
        delayed_bits: 24,
        block_size: 1000,
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rows.rp");
    let file = std::fs::File::create(&path).unwrap();
    let mut compressor =
        RelationCompressor::new(file, schema.clone(), config, opts, Arc::clone(&registry));
    let mut rng = StdRng::seed_from_u64(4);
    while compressor.needs_more_learning() {
        for _ in 0..NUM_EST_SAMPLE {
            compressor.learn_tuple(&tuples[rng.gen_range(0..tuples.len())]);
        }
        for t in &tuples {
            compressor.learn_tuple(t);
        }
        compressor.end_of_learning().unwrap();
    }
    for t in &tuples {
        compressor.compress_tuple(t).unwrap();
    }
    compressor.finish().unwrap();

    let mut dec = RelationDecompressor::open(&path, schema.clone(), opts, registry).unwrap();
    assert_eq!(dec.total_tuples(), 2000);
    let mut tuple = Tuple::new(schema.len());
    for expected in &tuples {
        dec.read_next_tuple(&mut tuple).unwrap();
        assert_eq!(&tuple, expected);
    }
}

#[test]
fn mixed_schema_roundtrip_with_learning() {
    let schema = Schema::new(vec![
        AttrType::Categorical,
        AttrType::Categorical,
        AttrType::Integer,
        AttrType::Str,
    ]);
    let mut rng = StdRng::seed_from_u64(11);
    let hosts = ["web-01", "web-02", "db-01", "cache-01"];
    let tuples: Vec<Tuple> = (0..6000)
        .map(|i| {
            let region = rng.gen_range(0..3);
            // Zone depends on region; the learner should notice.
            let zone = region * 2 + (i as i32 % 2);
            let mut t = Tuple::new(4);
            t.values[0] = AttrValue::Int(region);
            t.values[1] = AttrValue::Int(zone);
            t.values[2] = AttrValue::Int(rng.gen_range(-50..50));
            t.values[3] = AttrValue::Str(hosts[rng.gen_range(0..hosts.len())].to_string());
            t
        })
        .collect();

    let registry = enum_registry(&[(0, 3), (1, 6)], 4);
    let config = CompressionConfig {
        allowed_err: vec![0.0, 0.0, 0.0, 0.0],
        skip_model_learning: false,
    };
    let opts = CodingOptions {
        delayed_bits: 24,
        block_size: 2000,
    };
    let (data, _) = compress_all(&tuples, &schema, config, opts, Arc::clone(&registry));
    let decoded = decompress_all(data, &schema, opts, registry);
    assert_eq!(decoded, tuples);
}
