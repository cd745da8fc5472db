use std::error::Error;
use streamgate_cenc::{CencError, EncryptedSampleDescriptor, SubsampleRange, codec};

// xorshift, so every run walks the same layouts.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

fn random_layout(rng: &mut Lcg) -> (Vec<u8>, Vec<SubsampleRange>) {
    let count = rng.below(6) as usize;
    let ranges = (0..count)
        .map(|_| SubsampleRange::new(rng.below(40) as u32, rng.below(80) as u32))
        .collect::<Vec<_>>();
    let len = if ranges.is_empty() {
        rng.below(200) as usize
    } else {
        ranges.iter().map(SubsampleRange::len).sum()
    };
    let payload = (0..len).map(|_| rng.next() as u8).collect();
    (payload, ranges)
}

#[test]
fn scatter_of_gather_reproduces_payload() -> Result<(), Box<dyn Error>> {
    let mut rng = Lcg(0x9e37_79b9_7f4a_7c15);

    for _ in 0..500 {
        let (payload, ranges) = random_layout(&mut rng);
        let gathered = codec::gather(&payload, &ranges)?;
        assert_eq!(gathered.len(), codec::cipher_len(payload.len(), &ranges));

        let mut restored = payload.clone();
        codec::scatter(&mut restored, &ranges, &gathered)?;
        assert_eq!(restored, payload);
    }

    Ok(())
}

#[test]
fn scatter_only_touches_cipher_ranges() -> Result<(), Box<dyn Error>> {
    let mut rng = Lcg(42);

    for _ in 0..200 {
        let (payload, ranges) = random_layout(&mut rng);
        let inverted = codec::gather(&payload, &ranges)?
            .into_iter()
            .map(|byte| !byte)
            .collect::<Vec<_>>();

        let mut out = payload.clone();
        codec::scatter(&mut out, &ranges, &inverted)?;

        let mut offset = 0;
        for range in &ranges {
            let clear = range.clear as usize;
            let cipher = range.cipher as usize;
            assert_eq!(out[offset..offset + clear], payload[offset..offset + clear]);
            offset += clear;
            for i in offset..offset + cipher {
                assert_eq!(out[i], !payload[i]);
            }
            offset += cipher;
        }
    }

    Ok(())
}

#[test]
fn zero_subsample_sample_is_one_cipher_block() -> Result<(), Box<dyn Error>> {
    let sample = EncryptedSampleDescriptor::new(vec![0; 16], vec![1; 16]);
    let payload = vec![0xab; 1024];

    assert!(sample.is_encrypted());
    sample.validate(payload.len())?;
    assert_eq!(codec::gather(&payload, &sample.subsamples)?.len(), 1024);
    Ok(())
}

#[test]
fn side_data_with_short_map_is_rejected() {
    let result = EncryptedSampleDescriptor::from_side_data(&[0; 8], &[1; 16], 3, &[0; 12]);
    assert!(matches!(result, Err(CencError::Subsample(_))));
}

#[test]
fn ranges_not_covering_payload_are_rejected() {
    let ranges = [SubsampleRange::new(4, 4)];
    assert!(codec::gather(&[0; 9], &ranges).is_err());
    assert!(codec::scatter(&mut [0; 7], &ranges, &[0; 4]).is_err());
}
