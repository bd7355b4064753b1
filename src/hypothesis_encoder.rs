use crate::Result;
use crate::hypothesis::DecodedHypothesis;

pub trait HypothesisEncoder {
    fn write_hypothesis(&mut self, hypothesis: &DecodedHypothesis) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}
