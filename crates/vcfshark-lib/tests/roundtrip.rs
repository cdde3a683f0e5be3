use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use vcfshark_lib::archive::Archive;
use vcfshark_lib::{CompressedFile, FieldValue, KeyDesc, KeyDim, KeyKind, VariantDesc};

fn variant(chrom: &str, pos: i64, ref_allele: &str, alt: &str) -> VariantDesc {
    VariantDesc {
        chrom: chrom.as_bytes().to_vec(),
        pos,
        id: b".".to_vec(),
        ref_allele: ref_allele.as_bytes().to_vec(),
        alt: alt.as_bytes().to_vec(),
        qual: b"30".to_vec(),
    }
}

/// Write `variants` under the given schema, read everything back, and
/// assert bit-for-bit equality. Returns the archive bytes.
fn roundtrip(
    path: &Path,
    keys: Vec<KeyDesc>,
    samples: &[Vec<u8>],
    ploidy: u32,
    threads: u32,
    variants: &[(VariantDesc, Vec<FieldValue>)],
) -> Vec<u8> {
    let mut out = CompressedFile::open_for_writing(path, keys.len() as u32).unwrap();
    out.set_no_threads(threads).unwrap();
    out.set_ploidy(ploidy).unwrap();
    out.add_samples(samples).unwrap();
    out.set_meta(b"generated by roundtrip test").unwrap();
    out.set_header(b"##fileformat=VCFv4.3").unwrap();
    out.set_keys(keys.clone()).unwrap();
    for (desc, fields) in variants {
        out.set_variant(desc, fields).unwrap();
    }
    out.close().unwrap();

    let mut input = CompressedFile::open_for_reading(path).unwrap();
    assert_eq!(input.no_variants().unwrap(), variants.len() as u64);
    assert_eq!(input.no_samples().unwrap(), samples.len() as u32);
    assert_eq!(input.get_samples().unwrap(), samples);
    assert_eq!(input.get_header().unwrap(), b"##fileformat=VCFv4.3");

    let read_keys = input.get_keys().unwrap();
    assert_eq!(read_keys.len(), keys.len());
    for (a, b) in read_keys.iter().zip(&keys) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, b.name);
        assert_eq!(a.kind, b.kind);
    }

    for (i, (desc, fields)) in variants.iter().enumerate() {
        let (got_desc, got_fields) = input
            .get_variant()
            .unwrap()
            .unwrap_or_else(|| panic!("archive ended early at variant {i}"));
        assert_eq!(&got_desc, desc, "variant {i} database columns");
        assert_eq!(&got_fields, fields, "variant {i} fields");
    }
    assert!(input.get_variant().unwrap().is_none());
    assert!(input.eof());
    input.close().unwrap();

    std::fs::read(path).unwrap()
}

#[test]
fn empty_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.vcfshark");
    roundtrip(&path, Vec::new(), &[], 2, 1, &[]);
    assert!(std::fs::metadata(&path).unwrap().len() > 0);

    let mut input = CompressedFile::open_for_reading(&path).unwrap();
    assert!(input.eof());
    assert!(input.get_variant().unwrap().is_none());
}

#[test]
fn single_variant_single_sample_gt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("single.vcfshark");
    let keys = vec![KeyDesc::new(0, b"GT".to_vec(), KeyKind::Genotype, KeyDim::Variable)];
    // chr1 100 . A T 30  GT=0|1 coded htslib-style.
    let variants = vec![(
        variant("chr1", 100, "A", "T"),
        vec![FieldValue::Genotype(vec![2, 5])],
    )];
    roundtrip(&path, keys, &[b"sample0".to_vec()], 2, 1, &variants);
}

#[test]
fn mixed_kinds_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mixed.vcfshark");
    let keys = vec![
        KeyDesc::new(0, b"DP".to_vec(), KeyKind::Int, KeyDim::Scalar),
        KeyDesc::new(1, b"AF".to_vec(), KeyKind::Real, KeyDim::Variable),
        KeyDesc::new(2, b"ANN".to_vec(), KeyKind::Text, KeyDim::Variable),
        KeyDesc::new(3, b"DB".to_vec(), KeyKind::Flag, KeyDim::Scalar),
        KeyDesc::new(4, b"GT".to_vec(), KeyKind::Genotype, KeyDim::Variable),
    ];
    let samples: Vec<Vec<u8>> = (0..3).map(|i| format!("s{i}").into_bytes()).collect();

    let mut variants = Vec::new();
    for i in 0..500i64 {
        let fields = vec![
            if i % 7 == 0 {
                FieldValue::Empty
            } else {
                FieldValue::Int(vec![(i % 90) as i32, vcfshark_lib::INT_MISSING])
            },
            if i % 11 == 0 {
                FieldValue::Real(vec![])
            } else {
                FieldValue::Real(vec![i as f32 / 3.0])
            },
            match i % 4 {
                0 => FieldValue::Empty,
                1 => FieldValue::Text(Vec::new()),
                2 => FieldValue::Text(format!("missense_variant|gene{}", i % 13).into_bytes()),
                _ => FieldValue::Text(b"synonymous_variant|gene1".to_vec()),
            },
            if i % 3 == 0 { FieldValue::Flag } else { FieldValue::Empty },
            FieldValue::Genotype((0..6).map(|j| ((i + j) % 3) as u32 * 2).collect()),
        ];
        variants.push((variant("chr2", 1000 + i * 17, "A", "C"), fields));
    }
    roundtrip(&path, keys, &samples, 2, 2, &variants);
}

#[test]
fn equal_keys_become_a_link() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("link.vcfshark");
    let keys = vec![
        KeyDesc::new(0, b"K".to_vec(), KeyKind::Int, KeyDim::Scalar),
        KeyDesc::new(1, b"K2".to_vec(), KeyKind::Int, KeyDim::Scalar),
    ];
    let variants: Vec<_> = (0..10i64)
        .map(|i| {
            let v = FieldValue::Int(vec![(i * 5) as i32]);
            (variant("chr1", 100 + i, "G", "T"), vec![v.clone(), v])
        })
        .collect();
    roundtrip(&path, keys, &[], 2, 1, &variants);

    // The K2 streams must resolve to K's via links.
    let archive = Archive::open(&path).unwrap();
    let listing = archive.list_streams();
    let k2_data = listing.iter().find(|(n, ..)| n == "key_1_data").unwrap();
    assert_eq!(k2_data.1.as_deref(), Some("key_0_data"));
    assert_eq!(k2_data.2, 0, "a link stream owns no parts");
    let k2_size = listing.iter().find(|(n, ..)| n == "key_1_size").unwrap();
    assert_eq!(k2_size.1.as_deref(), Some("key_0_size"));
}

#[test]
fn mapped_key_costs_only_a_descriptor() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mapping.vcfshark");
    let keys = vec![
        KeyDesc::new(0, b"K1".to_vec(), KeyKind::Int, KeyDim::Scalar),
        KeyDesc::new(1, b"K2".to_vec(), KeyKind::Int, KeyDim::Scalar),
    ];
    let variants: Vec<_> = (0..1000usize)
        .map(|i| {
            let k1 = [10i32, 20, 30][i % 3];
            (
                variant("chr3", 50 + i as i64 * 3, "T", "A"),
                vec![FieldValue::Int(vec![k1]), FieldValue::Int(vec![k1 / 10])],
            )
        })
        .collect();
    roundtrip(&path, keys, &[], 2, 1, &variants);

    let archive = Archive::open(&path).unwrap();
    let listing = archive.list_streams();
    let k2_data = listing.iter().find(|(n, ..)| n == "key_1_data").unwrap();
    assert_eq!(k2_data.2, 0, "mapped key stores no data parts");
    let descriptor = listing.iter().find(|(n, ..)| n == "key_1_func_data").unwrap();
    assert_eq!(descriptor.2, 1);
    assert!(
        descriptor.3 < 256,
        "descriptor is O(|f|), got {} bytes",
        descriptor.3
    );
}

#[test]
fn wide_genotype_matrix_with_missing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gt.vcfshark");
    let keys = vec![KeyDesc::new(0, b"GT".to_vec(), KeyKind::Genotype, KeyDim::Variable)];
    let samples: Vec<Vec<u8>> = (0..100).map(|i| format!("s{i:03}").into_bytes()).collect();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let variants: Vec<_> = (0..100i64)
        .map(|i| {
            let row: Vec<u32> = (0..200)
                .map(|_| {
                    if rng.gen_bool(0.05) {
                        0 // missing
                    } else {
                        let allele = rng.gen_range(0..2u32);
                        ((allele + 1) << 1) | rng.gen_range(0..2u32)
                    }
                })
                .collect();
            (variant("chrX", 5000 + i * 11, "C", "G"), vec![FieldValue::Genotype(row)])
        })
        .collect();
    roundtrip(&path, keys, &samples, 2, 4, &variants);
}

#[test]
fn thread_count_does_not_change_bytes() {
    let dir = TempDir::new().unwrap();
    let keys = vec![
        KeyDesc::new(0, b"DP".to_vec(), KeyKind::Int, KeyDim::Scalar),
        KeyDesc::new(1, b"FILTER".to_vec(), KeyKind::Text, KeyDim::Variable),
        KeyDesc::new(2, b"GT".to_vec(), KeyKind::Genotype, KeyDim::Variable),
    ];
    let samples: Vec<Vec<u8>> = (0..8).map(|i| format!("s{i}").into_bytes()).collect();

    let variants: Vec<_> = (0..10_000i64)
        .map(|i| {
            let fields = vec![
                FieldValue::Int(vec![(i % 250) as i32]),
                FieldValue::Text(if i % 5 == 0 { b"PASS".to_vec() } else { b"q10;s50".to_vec() }),
                FieldValue::Genotype((0..16).map(|j| (((i + j) % 4) as u32) << 1).collect()),
            ];
            (variant("chr7", i * 2 + 1, "A", "G"), fields)
        })
        .collect();

    let path1 = dir.path().join("t1.vcfshark");
    let path8 = dir.path().join("t8.vcfshark");
    let bytes1 = roundtrip(&path1, keys.clone(), &samples, 2, 1, &variants);
    let bytes8 = roundtrip(&path8, keys, &samples, 2, 8, &variants);
    assert_eq!(bytes1, bytes8, "archives must be byte-identical across thread counts");
}

#[test]
fn multi_chunk_streams() {
    // Push a text key past its 8 MiB buffer cap so every stream spans
    // several parts.
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chunks.vcfshark");
    let keys = vec![
        KeyDesc::new(0, b"NOTE".to_vec(), KeyKind::Text, KeyDim::Variable),
        KeyDesc::new(1, b"DP".to_vec(), KeyKind::Int, KeyDim::Variable),
    ];

    let filler: Vec<String> = (0..7)
        .map(|i| format!("annotation_block_{i}_").repeat(1200))
        .collect();
    let variants: Vec<_> = (0..3000usize)
        .map(|i| {
            let fields = vec![
                FieldValue::Text(filler[i % filler.len()].clone().into_bytes()),
                FieldValue::Int(vec![i as i32, (i / 2) as i32]),
            ];
            (variant("chr11", i as i64 * 7, "G", "C"), fields)
        })
        .collect();
    roundtrip(&path, keys, &[], 2, 3, &variants);

    let archive = Archive::open(&path).unwrap();
    let listing = archive.list_streams();
    let note = listing.iter().find(|(n, ..)| n == "key_0_data").unwrap();
    assert!(note.2 > 1, "expected several parts, got {}", note.2);
}

#[test]
fn contract_violation_aborts_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("abort.vcfshark");
    let keys = vec![KeyDesc::new(0, b"DP".to_vec(), KeyKind::Int, KeyDim::Scalar)];
    let mut out = CompressedFile::open_for_writing(&path, 1).unwrap();
    out.set_keys(keys).unwrap();
    out.set_variant(&variant("chr1", 1, "A", "T"), &[FieldValue::Int(vec![3])]).unwrap();
    // Wrong arity: declared one key, supplied two fields.
    let err = out.set_variant(
        &variant("chr1", 2, "A", "T"),
        &[FieldValue::Int(vec![4]), FieldValue::Flag],
    );
    assert!(err.is_err());
    assert!(out.close().is_err(), "close after a contract violation must fail");
    assert!(!path.exists(), "no partial archive may be left behind");
}

#[test]
fn negative_and_extreme_values_survive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("extremes.vcfshark");
    let keys = vec![
        KeyDesc::new(0, b"I".to_vec(), KeyKind::Int, KeyDim::Variable),
        KeyDesc::new(1, b"R".to_vec(), KeyKind::Real, KeyDim::Variable),
    ];
    let variants = vec![
        (
            variant("chr1", i64::MAX / 2, "A", "T"),
            vec![
                FieldValue::Int(vec![i32::MAX, i32::MIN, 0, -1]),
                FieldValue::Real(vec![f32::MAX, f32::MIN_POSITIVE, -0.0]),
            ],
        ),
        (
            variant("chr1", 1, "A", "T"),
            vec![
                FieldValue::Int(vec![vcfshark_lib::INT_MISSING]),
                FieldValue::Real(vec![f32::INFINITY, f32::NEG_INFINITY]),
            ],
        ),
    ];
    roundtrip(&path, keys, &[], 2, 1, &variants);
}
