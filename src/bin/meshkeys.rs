/*!
# meshkeys

Mints key material for a gridmesh settings file: a fresh secp256k1
signing keypair and a random AES-128 key for secure data transfer.

```bash
cargo run --bin meshkeys
```
*/

use gridmesh::keystore::SigningKeypair;
use rand::RngCore;

fn main() {
    let keypair = SigningKeypair::generate();
    let mut cipher_key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut cipher_key);

    println!("signing secret_hex: {}", hex::encode(&keypair.secret_key()[..]));
    println!("signing public_hex: {}", hex::encode(keypair.public_key().serialize()));
    println!("address:            {}", keypair.address());
    println!("cipher key_hex:     {}", hex::encode(cipher_key));
}
