mod proptest_exactness;
