/*!
# Gridmesh Command Line Interface

## Help

```bash
gridmesh --help
```

## Example Usage

```bash
gridmesh --config=config/station
```

Settings come from a config file (TOML/JSON/YAML, name given without
extension). Fresh key material can be minted with the `meshkeys` binary.

## Dev

To run from source:

```bash
cargo run -- --help
cargo run -- --config=config/station
```
*/

use gridmesh::runtime;

#[tokio::main]
pub async fn main() -> gridmesh::Result<()> {
    tracing_subscriber::fmt::init();
    runtime::run().await
}
