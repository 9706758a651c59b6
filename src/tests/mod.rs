#[cfg(test)]
mod damage;
#[cfg(test)]
mod roundtrip;
