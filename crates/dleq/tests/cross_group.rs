use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use dleq::{Proof, Secret};

#[test]
fn same_secret_drives_both_curves() {
    let secret = Secret::from_bytes([7u8; 32]);
    let keys = Proof::new(&secret).verify().unwrap();

    let expected_ed = (&ED25519_BASEPOINT_POINT * &secret.ed25519_scalar())
        .compress()
        .to_bytes();
    assert_eq!(keys.ed25519, expected_ed);
}

#[test]
fn distinct_secrets_produce_distinct_commitments() {
    let a = Proof::new(&Secret::random()).verify().unwrap();
    let b = Proof::new(&Secret::random()).verify().unwrap();
    assert_ne!(a.commitment().unwrap(), b.commitment().unwrap());
}

#[test]
fn proof_is_not_transferable_between_secrets() {
    let proof_a = Proof::new(&Secret::random());
    let proof_b = Proof::new(&Secret::random());

    let mut franken = proof_a;
    franken.pub_secp256k1 = proof_b.pub_secp256k1;
    assert!(franken.verify().is_err());
}
